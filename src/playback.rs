//! Gapless scheduling of response audio with instantaneous interruption.
//!
//! Buffers are laid end to end on the output device's clock:
//!
//! ```text
//! start_at        = max(next_start_time, output.current_time())
//! next_start_time = start_at + buffer.duration()
//! ```
//!
//! so they play contiguously as long as they arrive faster than they are
//! consumed. A late buffer starts "now", leaving a gap; that is accepted
//! degradation, not an error. An interruption stops every live source and
//! rewinds the cursor to zero before anything else is scheduled.

use crate::error::{LiveError, Result};
use crate::media_in::audio::{dequantize, quantize};
use base64::Engine;
use std::collections::BTreeSet;
use tracing::debug;

pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Handle to a buffer handed to the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

/// Decoded response audio, mono.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundAudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl InboundAudioBuffer {
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Decode little-endian 16-bit PCM at 24 kHz.
    pub fn from_pcm16_le(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 2 != 0 {
            return Err(LiveError::Protocol(format!(
                "PCM payload has odd length {}",
                bytes.len()
            )));
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| dequantize(i16::from_le_bytes([pair[0], pair[1]])))
            .collect();
        Ok(Self::from_samples(samples, OUTPUT_SAMPLE_RATE))
    }

    pub fn from_base64(data: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| LiveError::Protocol(format!("invalid base64 audio: {}", e)))?;
        Self::from_pcm16_le(&bytes)
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn to_pcm16(&self) -> Vec<i16> {
        self.samples.iter().map(|&s| quantize(s)).collect()
    }
}

/// The inbound audio pipeline: a device with a monotonic clock that can start
/// buffers at a given time.
///
/// Implementations report natural completion of a source asynchronously as
/// [`crate::events::SessionEvent::PlaybackEnded`]. A source may be reported
/// ended while the device still buffers its tail, so only [`flush`] silences
/// everything handed over so far.
///
/// [`flush`]: AudioOutput::flush
pub trait AudioOutput: Send {
    /// Seconds on the output clock. Never decreases.
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` on the output clock (immediately if that
    /// is already past).
    fn play(&mut self, id: SourceId, buffer: InboundAudioBuffer, start_at: f64) -> Result<()>;

    /// Stop a scheduled or playing source. Stopping a finished or already
    /// stopped source is a no-op.
    fn stop(&mut self, id: SourceId);

    /// Discard every queued source and whatever the device still buffers.
    fn flush(&mut self);

    /// Close the pipeline, discarding anything still queued.
    fn close(&mut self);
}

/// Where a buffer landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_at: f64,
    pub end_at: f64,
}

/// Owns the clock cursor and the set of live sources.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start_time: f64,
    live: BTreeSet<SourceId>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        output: &mut dyn AudioOutput,
        buffer: InboundAudioBuffer,
    ) -> Result<ScheduledSource> {
        let start_at = self.next_start_time.max(output.current_time());
        let duration = buffer.duration();
        let id = SourceId(self.next_id);
        self.next_id += 1;

        output.play(id, buffer, start_at)?;

        self.live.insert(id);
        self.next_start_time = start_at + duration;
        debug!(
            "Scheduled source {} at {:.3}s for {:.3}s ({} live)",
            id.0,
            start_at,
            duration,
            self.live.len()
        );

        Ok(ScheduledSource {
            id,
            start_at,
            end_at: self.next_start_time,
        })
    }

    /// Natural completion. Returns false for sources already flushed.
    pub fn on_ended(&mut self, id: SourceId) -> bool {
        self.live.remove(&id)
    }

    /// Barge-in: stop every live source, flush the device, empty the set and
    /// rewind the cursor. Returns how many live sources were stopped.
    ///
    /// The device is flushed even with an empty live set: sources already
    /// reported ended can still be sitting in its buffer.
    pub fn interrupt(&mut self, output: &mut dyn AudioOutput) -> usize {
        let flushed = std::mem::take(&mut self.live);
        for id in &flushed {
            output.stop(*id);
        }
        output.flush();
        self.next_start_time = 0.0;
        flushed.len()
    }

    /// Forget all sources without touching a device, for when the output is
    /// already gone.
    pub fn reset(&mut self) {
        self.live.clear();
        self.next_start_time = 0.0;
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, id: SourceId) -> bool {
        self.live.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualOutput;

    fn buffer(seconds: f64) -> InboundAudioBuffer {
        let n = (seconds * OUTPUT_SAMPLE_RATE as f64).round() as usize;
        InboundAudioBuffer::from_samples(vec![0.0; n], OUTPUT_SAMPLE_RATE)
    }

    #[test]
    fn decode_pcm16() {
        let mut bytes = Vec::new();
        for s in [0i16, 16384, -32768, 32767] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let decoded = InboundAudioBuffer::from_base64(&encoded).unwrap();

        assert_eq!(decoded.samples(), &[0.0, 0.5, -1.0, 32767.0 / 32768.0]);
        assert_eq!(decoded.sample_rate(), 24_000);
        assert_eq!(decoded.to_pcm16(), vec![0, 16384, -32768, 32767]);
    }

    #[test]
    fn decode_rejects_bad_payloads() {
        assert!(InboundAudioBuffer::from_pcm16_le(&[1, 2, 3]).is_err());
        assert!(InboundAudioBuffer::from_base64("%%%").is_err());
    }

    #[test]
    fn duration_follows_sample_count() {
        assert_eq!(buffer(0.5).duration(), 0.5);
        assert_eq!(InboundAudioBuffer::from_pcm16_le(&[0; 48_000]).unwrap().duration(), 1.0);
    }

    #[test]
    fn buffers_play_back_to_back() {
        let mut output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new();

        let a = scheduler.schedule(&mut output, buffer(0.25)).unwrap();
        let b = scheduler.schedule(&mut output, buffer(0.5)).unwrap();
        let c = scheduler.schedule(&mut output, buffer(0.75)).unwrap();

        assert_eq!(a.start_at, 0.0);
        assert_eq!(b.start_at, 0.25);
        assert_eq!(c.start_at, 0.25 + 0.5);
        assert_eq!(scheduler.next_start_time(), 1.5);
        assert_eq!(scheduler.live_count(), 3);
        assert_eq!(output.played().len(), 3);
    }

    #[test]
    fn late_buffer_starts_at_clock() {
        let mut output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new();

        scheduler.schedule(&mut output, buffer(0.5)).unwrap();
        output.set_time(2.0);
        let late = scheduler.schedule(&mut output, buffer(0.5)).unwrap();

        assert_eq!(late.start_at, 2.0);
        assert_eq!(scheduler.next_start_time(), 2.5);
    }

    #[test]
    fn ten_half_second_buffers_span_five_seconds() {
        let mut output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new();

        let scheduled: Vec<_> = (0..10)
            .map(|_| scheduler.schedule(&mut output, buffer(0.5)).unwrap())
            .collect();

        for pair in scheduled.windows(2) {
            assert_eq!(pair[1].start_at, pair[0].end_at, "gap between sources");
        }
        assert_eq!(scheduled[0].start_at, 0.0);
        assert_eq!(scheduled[9].end_at, 5.0);
    }

    #[test]
    fn interruption_flushes_and_rewinds() {
        let mut output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new();

        let first_three: Vec<_> = (0..3)
            .map(|_| scheduler.schedule(&mut output, buffer(0.5)).unwrap())
            .collect();
        assert_eq!(scheduler.next_start_time(), 1.5);

        assert_eq!(scheduler.interrupt(&mut output), 3);
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert_eq!(output.flushes(), 1);
        let stopped = output.stopped();
        for source in &first_three {
            assert!(stopped.contains(&source.id));
        }

        let next = scheduler.schedule(&mut output, buffer(0.5)).unwrap();
        assert_eq!(next.start_at, 0.0);
    }

    #[test]
    fn interruption_rewinds_to_current_clock() {
        let mut output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new();

        for _ in 0..4 {
            scheduler.schedule(&mut output, buffer(1.0)).unwrap();
        }
        output.set_time(1.25);
        scheduler.interrupt(&mut output);

        let next = scheduler.schedule(&mut output, buffer(0.5)).unwrap();
        assert_eq!(next.start_at, 1.25);
        assert_eq!(scheduler.next_start_time(), 1.75);
    }

    #[test]
    fn ended_sources_leave_the_set() {
        let mut output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new();

        let a = scheduler.schedule(&mut output, buffer(0.1)).unwrap();
        let b = scheduler.schedule(&mut output, buffer(0.1)).unwrap();

        assert!(scheduler.on_ended(a.id));
        assert!(!scheduler.is_live(a.id));
        assert!(scheduler.is_live(b.id));
        // A second "ended" for the same source is harmless.
        assert!(!scheduler.on_ended(a.id));

        scheduler.interrupt(&mut output);
        // Only b was still live, so only b is stopped.
        assert_eq!(output.stopped(), vec![b.id]);
        assert!(!scheduler.on_ended(b.id));
    }

    #[test]
    fn interruption_flushes_audio_already_reported_ended() {
        let mut output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new();

        let a = scheduler.schedule(&mut output, buffer(1.0)).unwrap();
        // Fully written to the device, which may still be playing it.
        assert!(scheduler.on_ended(a.id));
        assert_eq!(scheduler.live_count(), 0);

        assert_eq!(scheduler.interrupt(&mut output), 0);
        assert!(output.stopped().is_empty());
        assert_eq!(output.flushes(), 1);
    }

    #[test]
    fn failed_play_does_not_advance_cursor() {
        let mut output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new();

        scheduler.schedule(&mut output, buffer(0.5)).unwrap();
        output.close();
        assert!(scheduler.schedule(&mut output, buffer(0.5)).is_err());
        assert_eq!(scheduler.next_start_time(), 0.5);
        assert_eq!(scheduler.live_count(), 1);
    }
}
