//! Session recorder - writes both audio directions to WAV for later inspection

use crate::error::Result;
use crate::events::SessionId;
use crate::media_in::audio::{INPUT_CHANNELS, INPUT_SAMPLE_RATE};
use crate::playback::OUTPUT_SAMPLE_RATE;
use chrono::Local;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type Writer = WavWriter<BufWriter<File>>;

fn pcm16(sample_rate: u32, channels: u16) -> WavSpec {
    WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

pub struct SessionRecorder {
    dir: PathBuf,
    input: Writer,   // microphone, 16 kHz
    output: Writer,  // model voice, 24 kHz
}

impl SessionRecorder {
    /// Create `<root>/<timestamp>_<session id>/` with `input.wav` and `output.wav`.
    pub fn create(root: &Path, session: &SessionId) -> Result<Self> {
        let ts = Local::now().format("%Y%m%d_%H%M%S");
        let dir = root.join(format!("{}_{}", ts, session));
        fs::create_dir_all(&dir)?;

        let input = WavWriter::create(dir.join("input.wav"), pcm16(INPUT_SAMPLE_RATE, INPUT_CHANNELS))?;
        let output = WavWriter::create(dir.join("output.wav"), pcm16(OUTPUT_SAMPLE_RATE, 1))?;

        info!("Recording session to {:?}", dir);
        Ok(Self { dir, input, output })
    }

    /// Little-endian PCM as sent to the service.
    pub fn write_input(&mut self, pcm_bytes: &[u8]) -> Result<()> {
        for pair in pcm_bytes.chunks_exact(2) {
            self.input.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        Ok(())
    }

    pub fn write_output(&mut self, samples: &[i16]) -> Result<()> {
        for &sample in samples {
            self.output.write_sample(sample)?;
        }
        Ok(())
    }

    /// Patch the WAV headers and close both files.
    pub fn finalize(self) -> Result<PathBuf> {
        let input_len = self.input.len();
        let output_len = self.output.len();
        self.input.finalize()?;
        self.output.finalize()?;
        debug!("Recorded {} input and {} output samples", input_len, output_len);
        Ok(self.dir)
    }
}
