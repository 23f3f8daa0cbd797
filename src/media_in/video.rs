//! Low-rate frame sampling of the session's video source

use crate::events::{EventSender, SessionEvent};
use crate::protocol::{MediaBlob, IMAGE_MIME};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageResult, RgbaImage};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// A compressed frame, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundImageChunk {
    pub jpeg_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mime_type: &'static str,
}

impl OutboundImageChunk {
    pub fn to_blob(&self) -> MediaBlob {
        MediaBlob {
            data: base64::engine::general_purpose::STANDARD.encode(&self.jpeg_bytes),
            mime_type: self.mime_type.to_string(),
        }
    }
}

/// An acquired camera (or other frame source).
///
/// Shared between the session, which releases it, and the sampling task,
/// which polls it.
pub trait VideoSource: Send + Sync {
    /// The most recent frame, or `None` if the source has nothing ready yet.
    fn ready_frame(&self) -> Option<RgbaImage>;

    /// Stop the device. Further `ready_frame` calls return `None`.
    fn release(&self);
}

/// Downscales to a fixed width and compresses to JPEG.
#[derive(Debug, Clone, Copy)]
pub struct FrameSampler {
    width: u32,
    quality: u8,
}

impl FrameSampler {
    pub fn new(width: u32, quality: u8) -> Self {
        Self {
            width: width.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    /// Output height for a frame of the given size, keeping aspect ratio.
    pub fn scaled_height(&self, width: u32, height: u32) -> u32 {
        if width == 0 {
            return 1;
        }
        ((height as u64 * self.width as u64 + width as u64 / 2) / width as u64).max(1) as u32
    }

    pub fn encode(&self, frame: &RgbaImage) -> ImageResult<OutboundImageChunk> {
        let height = self.scaled_height(frame.width(), frame.height());
        let resized = image::imageops::resize(frame, self.width, height, FilterType::Triangle);
        // JPEG has no alpha channel.
        let rgb = DynamicImage::ImageRgba8(resized).to_rgb8();

        let mut jpeg_bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg_bytes, self.quality).encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )?;

        Ok(OutboundImageChunk {
            jpeg_bytes,
            width: rgb.width(),
            height: rgb.height(),
            mime_type: IMAGE_MIME,
        })
    }
}

/// Sample `source` every `period` and forward each encoded frame.
///
/// Best effort: a tick with no ready frame, or a frame that fails to encode,
/// is skipped without error. The task ends when the session goes away or the
/// handle is aborted.
pub fn spawn_frame_sampler(
    source: Arc<dyn VideoSource>,
    sampler: FrameSampler,
    period: Duration,
    events: EventSender,
) -> JoinHandle<()> {
    info!("Starting frame sampling every {}ms", period.as_millis());

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let Some(frame) = source.ready_frame() else {
                debug!("No frame ready, skipping tick");
                continue;
            };

            match sampler.encode(&frame) {
                Ok(chunk) => {
                    debug!(
                        "Sampled frame {}x{} ({} KB)",
                        chunk.width,
                        chunk.height,
                        chunk.jpeg_bytes.len() / 1024
                    );
                    if !events.send(SessionEvent::Frame(chunk)) {
                        break;
                    }
                }
                Err(e) => debug!("Dropping frame that failed to encode: {}", e),
            }
        }
    })
}

#[cfg(feature = "capture")]
pub use screen::ScreenSource;

#[cfg(feature = "capture")]
mod screen {
    use super::*;
    use anyhow::Context;
    use std::sync::mpsc::Receiver;
    use std::sync::Mutex;
    use tracing::warn;
    use xcap::{Frame, Monitor, VideoRecorder};

    /// Frames from the primary monitor via `xcap`.
    pub struct ScreenSource {
        recorder: Mutex<Option<VideoRecorder>>,
        frames: Mutex<Receiver<Frame>>,
    }

    impl ScreenSource {
        pub fn open() -> anyhow::Result<Self> {
            let monitors = Monitor::all().context("Failed to enumerate monitors")?;
            let monitor = monitors
                .iter()
                .find(|m| m.is_primary().unwrap_or(false))
                .or_else(|| monitors.first())
                .context("No monitors found")?
                .clone();

            info!(
                "Using monitor: {} ({}x{})",
                monitor.name().unwrap_or_else(|_| "Unknown".to_string()),
                monitor.width().unwrap_or(0),
                monitor.height().unwrap_or(0)
            );

            let (recorder, frames) = monitor.video_recorder().context("Failed to open video recorder")?;
            recorder.start().context("Failed to start video recorder")?;

            Ok(Self {
                recorder: Mutex::new(Some(recorder)),
                frames: Mutex::new(frames),
            })
        }
    }

    impl VideoSource for ScreenSource {
        fn ready_frame(&self) -> Option<RgbaImage> {
            let frames = self.frames.lock().ok()?;
            // Only the newest frame matters at a 1 Hz sampling rate.
            let frame = frames.try_iter().last()?;
            RgbaImage::from_raw(frame.width, frame.height, frame.raw)
        }

        fn release(&self) {
            let Ok(mut recorder) = self.recorder.lock() else {
                return;
            };
            if let Some(recorder) = recorder.take() {
                if let Err(e) = recorder.stop() {
                    warn!("Failed to stop video recorder: {}", e);
                }
                info!("Screen capture released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{SessionId, SessionInput};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255]))
    }

    #[test]
    fn scaled_height_keeps_aspect_ratio() {
        let sampler = FrameSampler::new(320, 50);
        assert_eq!(sampler.scaled_height(1280, 720), 180);
        assert_eq!(sampler.scaled_height(640, 480), 240);
        assert_eq!(sampler.scaled_height(4000, 1), 1);
    }

    #[test]
    fn encode_produces_small_jpeg() {
        let sampler = FrameSampler::new(320, 50);
        let chunk = sampler.encode(&gradient(1280, 720)).unwrap();

        assert_eq!((chunk.width, chunk.height), (320, 180));
        assert_eq!(&chunk.jpeg_bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(chunk.to_blob().mime_type, "image/jpeg");

        let decoded = image::load_from_memory(&chunk.jpeg_bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 180));
    }

    /// Ready only on every other poll.
    struct FlakySource {
        polls: AtomicUsize,
    }

    impl VideoSource for FlakySource {
        fn ready_frame(&self) -> Option<RgbaImage> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            (n % 2 == 1).then(|| gradient(64, 48))
        }

        fn release(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_skips_ticks_without_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = Arc::new(FlakySource {
            polls: AtomicUsize::new(0),
        });
        let events = EventSender::new(SessionId("s".to_string()), tx);
        let handle = spawn_frame_sampler(source.clone(), FrameSampler::new(32, 40), Duration::from_secs(1), events);

        match rx.recv().await.unwrap() {
            SessionInput::Session {
                event: SessionEvent::Frame(chunk),
                ..
            } => assert_eq!((chunk.width, chunk.height), (32, 24)),
            other => panic!("Unexpected input: {:?}", other),
        }
        // First tick had nothing ready; the frame came from the second.
        assert_eq!(source.polls.load(Ordering::SeqCst), 2);

        handle.abort();
    }
}
