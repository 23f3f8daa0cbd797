//! Speaker output with a monotonic sample clock.
//!
//! The clock is the number of frames handed to the device, so it never goes
//! backwards and only advances while something (audio or padding silence) is
//! being written.
#![cfg_attr(not(feature = "pulse"), allow(dead_code))]

use crate::playback::SourceId;
use std::collections::VecDeque;
use tracing::debug;

/// 20 ms at 24 kHz.
const SLICE_FRAMES: usize = 480;

#[derive(Debug)]
struct QueuedSource {
    id: SourceId,
    start_frame: u64,
    samples: Vec<i16>,
    pos: usize,
}

/// What the writer thread should hand to the device next.
#[derive(Debug, PartialEq)]
enum Chunk<'a> {
    Idle,
    Silence(usize),
    Samples(&'a [i16]),
}

/// Sources waiting to be written, in start order.
#[derive(Debug, Default)]
struct PlaybackQueue {
    items: VecDeque<QueuedSource>,
}

impl PlaybackQueue {
    fn push(&mut self, id: SourceId, start_frame: u64, samples: Vec<i16>) {
        let at = self.items.partition_point(|item| item.start_frame <= start_frame);
        self.items.insert(
            at,
            QueuedSource {
                id,
                start_frame,
                samples,
                pos: 0,
            },
        );
    }

    fn next_chunk(&self, clock: u64, max: usize) -> Chunk<'_> {
        let Some(front) = self.items.front() else {
            return Chunk::Idle;
        };
        if front.pos == 0 && clock < front.start_frame {
            let gap = (front.start_frame - clock).min(max as u64) as usize;
            return Chunk::Silence(gap);
        }
        let end = (front.pos + max).min(front.samples.len());
        Chunk::Samples(&front.samples[front.pos..end])
    }

    /// Mark `written` samples of the front source as played. Returns its id
    /// once it has been written completely.
    fn advance(&mut self, written: usize) -> Option<SourceId> {
        let front = self.items.front_mut()?;
        front.pos += written;
        if front.pos >= front.samples.len() {
            return self.items.pop_front().map(|item| item.id);
        }
        None
    }

    /// Drop a source. Returns true when it had already started, meaning the
    /// device buffer holds some of it.
    fn remove(&mut self, id: SourceId) -> bool {
        match self.items.iter().position(|item| item.id == id) {
            Some(index) => self.items.remove(index).is_some_and(|item| item.pos > 0),
            None => false,
        }
    }

    /// Drop every source. Returns how many were queued.
    fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Requests from the session to the writer thread.
enum Command {
    Play {
        id: SourceId,
        start_frame: u64,
        samples: Vec<i16>,
    },
    Stop(SourceId),
    Flush,
    Close,
}

/// Apply one command to the queue. `flush_device` discards what the sound
/// server has buffered but not yet played. Returns false on close.
fn apply<F>(queue: &mut PlaybackQueue, command: Command, mut flush_device: F) -> anyhow::Result<bool>
where
    F: FnMut() -> anyhow::Result<()>,
{
    match command {
        Command::Play { id, start_frame, samples } => queue.push(id, start_frame, samples),
        Command::Stop(id) => {
            if queue.remove(id) {
                flush_device()?;
            }
        }
        Command::Flush => {
            let dropped = queue.clear();
            debug!("Flushing playback ({} queued source(s) dropped)", dropped);
            flush_device()?;
        }
        Command::Close => return Ok(false),
    }
    Ok(true)
}

#[cfg(feature = "pulse")]
pub use pulse::PulseSpeaker;

#[cfg(feature = "pulse")]
mod pulse {
    use super::*;
    use crate::error::{DeviceError, DeviceKind, LiveError};
    use crate::events::{EventSender, SessionEvent};
    use crate::playback::{AudioOutput, InboundAudioBuffer, OUTPUT_SAMPLE_RATE};
    use anyhow::Context;
    use libpulse_binding as pulse;
    use libpulse_simple_binding as psimple;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc::{self, TryRecvError};
    use std::sync::Arc;
    use tracing::{error, info};

    /// PulseAudio playback stream at 24 kHz mono, written on a dedicated thread.
    pub struct PulseSpeaker {
        commands: mpsc::Sender<Command>,
        frames_written: Arc<AtomicU64>,
        closed: bool,
    }

    impl PulseSpeaker {
        pub fn open(app_name: &str, device: Option<&str>, events: EventSender) -> Result<Self, DeviceError> {
            let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);
            let (commands, command_rx) = mpsc::channel::<Command>();
            let frames_written = Arc::new(AtomicU64::new(0));
            let clock = frames_written.clone();
            let app_name = app_name.to_string();
            let device = device.map(|d| d.to_string());

            std::thread::Builder::new()
                .name("speaker".to_string())
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
                    if let Err(e) = write_loop(simple, command_rx, clock, events) {
                        error!("Speaker output error: {:#}", e);
                    }
                })
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

            match ready_rx.recv() {
                Ok(Ok(())) => {
                    info!("Speaker output connected successfully");
                    Ok(Self {
                        commands,
                        frames_written,
                        closed: false,
                    })
                }
                Ok(Err(msg)) => Err(DeviceError::Unavailable(msg)),
                Err(_) => Err(DeviceError::Unavailable("speaker thread exited".to_string())),
            }
        }
    }

    fn connect(app_name: &str, device: Option<&str>) -> anyhow::Result<psimple::Simple> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: 1,
            rate: OUTPUT_SAMPLE_RATE,
        };
        psimple::Simple::new(
            None,
            app_name,
            pulse::stream::Direction::Playback,
            device,
            "assistant voice",
            &spec,
            None,
            None,
        )
        .context("Failed to create PulseAudio playback connection")
    }

    fn write_loop(
        simple: psimple::Simple,
        commands: mpsc::Receiver<Command>,
        clock: Arc<AtomicU64>,
        events: EventSender,
    ) -> anyhow::Result<()> {
        let mut queue = PlaybackQueue::default();
        let mut written: u64 = 0;
        let mut bytes = Vec::with_capacity(SLICE_FRAMES * 2);

        let flush_device = || simple.flush().context("Failed to flush playback");

        loop {
            loop {
                match commands.try_recv() {
                    Ok(command) => {
                        if !apply(&mut queue, command, flush_device)? {
                            info!("Speaker output closed");
                            return Ok(());
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            bytes.clear();
            let mut played = None;
            match queue.next_chunk(written, SLICE_FRAMES) {
                Chunk::Idle => {
                    // Nothing scheduled: park until the session sends something.
                    match commands.recv() {
                        Ok(command) => {
                            if !apply(&mut queue, command, flush_device)? {
                                info!("Speaker output closed");
                                return Ok(());
                            }
                        }
                        Err(_) => return Ok(()),
                    }
                    continue;
                }
                Chunk::Silence(frames) => bytes.resize(frames * 2, 0),
                Chunk::Samples(samples) => {
                    for sample in samples {
                        bytes.extend_from_slice(&sample.to_le_bytes());
                    }
                    played = Some(samples.len());
                }
            }

            if !bytes.is_empty() {
                simple.write(&bytes).context("Failed to write audio")?;
                written += (bytes.len() / 2) as u64;
                clock.store(written, Ordering::Relaxed);
            }
            if let Some(count) = played {
                if let Some(id) = queue.advance(count) {
                    debug!("Source {} finished ({} still queued)", id.0, queue.len());
                    events.send(SessionEvent::PlaybackEnded(id));
                }
            }
        }
    }

    impl AudioOutput for PulseSpeaker {
        fn current_time(&self) -> f64 {
            self.frames_written.load(Ordering::Relaxed) as f64 / OUTPUT_SAMPLE_RATE as f64
        }

        fn play(&mut self, id: SourceId, buffer: InboundAudioBuffer, start_at: f64) -> crate::Result<()> {
            let start_frame = (start_at.max(0.0) * OUTPUT_SAMPLE_RATE as f64).round() as u64;
            self.commands
                .send(Command::Play {
                    id,
                    start_frame,
                    samples: buffer.to_pcm16(),
                })
                .map_err(|_| {
                    LiveError::device(DeviceKind::Speaker, DeviceError::Unavailable("speaker thread exited".to_string()))
                })
        }

        fn stop(&mut self, id: SourceId) {
            let _ = self.commands.send(Command::Stop(id));
        }

        fn flush(&mut self) {
            let _ = self.commands.send(Command::Flush);
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                let _ = self.commands.send(Command::Close);
            }
        }
    }

    impl Drop for PulseSpeaker {
        fn drop(&mut self) {
            self.close();
        }
    }
}
