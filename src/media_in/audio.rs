//! Microphone capture and 16-bit PCM encoding of outbound audio

use crate::events::EventSender;
use crate::protocol::{MediaBlob, INPUT_AUDIO_MIME};
use base64::Engine;

pub const INPUT_SAMPLE_RATE: u32 = 16_000;
pub const INPUT_CHANNELS: u16 = 1;

/// Quantize a float sample in `[-1.0, 1.0]` to signed 16-bit PCM.
///
/// Out-of-range input saturates; `1.0` maps to `i16::MAX`.
pub fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32768.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Inverse of [`quantize`].
pub fn dequantize(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// One encoded capture block, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundAudioChunk {
    /// Little-endian 16-bit samples.
    pub pcm_bytes: Vec<u8>,
    /// `pcm_bytes`, base64 encoded.
    pub data: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub mime_type: &'static str,
}

impl OutboundAudioChunk {
    pub fn to_blob(&self) -> MediaBlob {
        MediaBlob {
            data: self.data.clone(),
            mime_type: self.mime_type.to_string(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.pcm_bytes.len() / 2
    }
}

/// Turns fixed-size float blocks from the capture callback into PCM chunks.
///
/// The byte buffer is reused across callbacks; each call encodes exactly one
/// block and nothing is carried over to the next.
#[derive(Debug)]
pub struct AudioCaptureEncoder {
    buffer: Vec<u8>,
}

impl AudioCaptureEncoder {
    pub fn new(block_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(block_size * 2),
        }
    }

    pub fn encode(&mut self, block: &[f32]) -> OutboundAudioChunk {
        self.buffer.clear();
        for &sample in block {
            self.buffer.extend_from_slice(&quantize(sample).to_le_bytes());
        }

        OutboundAudioChunk {
            data: base64::engine::general_purpose::STANDARD.encode(&self.buffer),
            pcm_bytes: self.buffer.clone(),
            sample_rate: INPUT_SAMPLE_RATE,
            channels: INPUT_CHANNELS,
            mime_type: INPUT_AUDIO_MIME,
        }
    }
}

/// An acquired microphone.
///
/// Acquisition happens when the session starts; blocks only begin flowing
/// once `start` is called on transport open.
pub trait AudioInput: Send {
    /// Begin the capture callback. Each block is encoded and sent as
    /// [`crate::events::SessionEvent::Audio`].
    fn start(&mut self, encoder: AudioCaptureEncoder, events: EventSender) -> crate::Result<()>;

    /// Stop the callback and release the device.
    fn release(&mut self);
}

#[cfg(feature = "pulse")]
pub use pulse::PulseMicrophone;

#[cfg(feature = "pulse")]
mod pulse {
    use super::*;
    use crate::error::{DeviceError, DeviceKind, LiveError};
    use crate::events::SessionEvent;
    use anyhow::Context;
    use libpulse_binding as pulse;
    use libpulse_simple_binding as psimple;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use tracing::{debug, error, info};

    struct StartCapture {
        encoder: AudioCaptureEncoder,
        events: EventSender,
    }

    /// PulseAudio record stream at 16 kHz mono float, read on a dedicated thread.
    pub struct PulseMicrophone {
        control: Option<mpsc::Sender<StartCapture>>,
        shutdown: Arc<AtomicBool>,
    }

    impl PulseMicrophone {
        /// Connect to the default (or named) source. Returns once the stream is open.
        pub fn open(app_name: &str, device: Option<&str>, block_size: usize) -> Result<Self, DeviceError> {
            let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);
            let (control_tx, control_rx) = mpsc::channel::<StartCapture>();
            let shutdown = Arc::new(AtomicBool::new(false));
            let shutdown_clone = shutdown.clone();
            let app_name = app_name.to_string();
            let device = device.map(|d| d.to_string());

            std::thread::Builder::new()
                .name("mic-capture".to_string())
                .spawn(move || {
                    let simple = match connect(&app_name, device.as_deref()) {
                        Ok(simple) => {
                            let _ = ready_tx.send(Ok(()));
                            simple
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(format!("{:#}", e)));
                            return;
                        }
                    };
                    if let Err(e) = capture_loop(simple, block_size, control_rx, shutdown_clone) {
                        error!("Microphone capture error: {:#}", e);
                    }
                })
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

            match ready_rx.recv() {
                Ok(Ok(())) => {
                    info!("Microphone capture connected successfully");
                    Ok(Self {
                        control: Some(control_tx),
                        shutdown,
                    })
                }
                Ok(Err(msg)) => Err(DeviceError::Unavailable(msg)),
                Err(_) => Err(DeviceError::Unavailable("capture thread exited".to_string())),
            }
        }
    }

    fn connect(app_name: &str, device: Option<&str>) -> anyhow::Result<psimple::Simple> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::F32le,
            channels: INPUT_CHANNELS as u8,
            rate: INPUT_SAMPLE_RATE,
        };
        psimple::Simple::new(
            None,
            app_name,
            pulse::stream::Direction::Record,
            device,
            "microphone",
            &spec,
            None,
            None,
        )
        .context("Failed to create PulseAudio microphone connection")
    }

    fn capture_loop(
        simple: psimple::Simple,
        block_size: usize,
        control: mpsc::Receiver<StartCapture>,
        shutdown: Arc<AtomicBool>,
    ) -> anyhow::Result<()> {
        // Hold the device until the session either starts capture or releases it.
        let StartCapture { mut encoder, events } = match control.recv() {
            Ok(start) => start,
            Err(_) => {
                debug!("Microphone released before capture started");
                return Ok(());
            }
        };

        info!("Microphone capture started ({} samples per block)", block_size);
        let mut bytes = vec![0u8; block_size * 4];
        let mut block = vec![0f32; block_size];

        while !shutdown.load(Ordering::Relaxed) {
            simple.read(&mut bytes).context("Failed to read audio")?;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            for (sample, raw) in block.iter_mut().zip(bytes.chunks_exact(4)) {
                *sample = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            }
            if !events.send(SessionEvent::Audio(encoder.encode(&block))) {
                break;
            }
        }

        info!("Microphone capture stopped");
        Ok(())
    }

    impl AudioInput for PulseMicrophone {
        fn start(&mut self, encoder: AudioCaptureEncoder, events: EventSender) -> crate::Result<()> {
            let control = self.control.as_ref().ok_or_else(|| {
                LiveError::device(DeviceKind::Microphone, DeviceError::Unavailable("released".to_string()))
            })?;
            control.send(StartCapture { encoder, events }).map_err(|_| {
                LiveError::device(
                    DeviceKind::Microphone,
                    DeviceError::Unavailable("capture thread exited".to_string()),
                )
            })
        }

        fn release(&mut self) {
            self.shutdown.store(true, Ordering::Relaxed);
            // Dropping the sender wakes a thread still waiting for `start`.
            self.control.take();
        }
    }

    impl Drop for PulseMicrophone {
        fn drop(&mut self) {
            self.release();
        }
    }
}
