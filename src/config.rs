//! Session configuration and the persisted key/value store it is loaded from.

use crate::error::{LiveError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Keys understood by [`LiveConfig::from_store`].
pub mod keys {
    pub const MODEL: &str = "model";
    pub const VOICE: &str = "voice";
    pub const SYSTEM_INSTRUCTION: &str = "system_instruction";
    pub const CAMERA: &str = "camera";
    pub const INPUT_TRANSCRIPTION: &str = "input_transcription";
    pub const OUTPUT_TRANSCRIPTION: &str = "output_transcription";
    pub const TOOL_TIMEOUT_MS: &str = "tool_timeout_ms";
    pub const RECORD_DIR: &str = "record_dir";
}

/// Configuration for a live session
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: Option<String>,
    pub input_transcription: bool,
    pub output_transcription: bool,
    /// Request the camera at start. Cleared on the session if acquisition fails.
    pub camera_enabled: bool,
    /// Samples per capture callback at 16 kHz.
    pub capture_block_size: usize,
    pub frame_interval: Duration,
    pub frame_width: u32,
    pub jpeg_quality: u8,
    /// How long to wait for `setupComplete` after sending `setup`.
    pub setup_timeout: Duration,
    /// Upper bound on a local tool handler. `None` leaves handlers unbounded.
    pub tool_timeout: Option<Duration>,
    /// Write both audio directions to WAV files under this directory.
    pub record_dir: Option<PathBuf>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            voice: "Zephyr".to_string(),
            system_instruction: None,
            input_transcription: true,
            output_transcription: true,
            camera_enabled: false,
            capture_block_size: 4096,
            frame_interval: Duration::from_secs(1),
            frame_width: 320,
            jpeg_quality: 50,
            setup_timeout: Duration::from_secs(10),
            tool_timeout: None,
            record_dir: None,
        }
    }
}

impl LiveConfig {
    /// Full websocket URL including the API key.
    pub fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }

    /// Build a config from stored values, falling back to defaults for missing keys.
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self> {
        let mut config = Self::default();
        config.apply(|key| store.get(key))?;
        Ok(config)
    }

    /// Override fields from `MMLIVE_*` environment variables and `GEMINI_API_KEY`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            self.api_key = key;
        }
        self.apply(|key| std::env::var(format!("MMLIVE_{}", key.to_uppercase())).ok())
    }

    fn apply(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(model) = lookup(keys::MODEL) {
            self.model = model;
        }
        if let Some(voice) = lookup(keys::VOICE) {
            self.voice = voice;
        }
        if let Some(instruction) = lookup(keys::SYSTEM_INSTRUCTION) {
            self.system_instruction = Some(instruction);
        }
        if let Some(value) = lookup(keys::CAMERA) {
            self.camera_enabled = parse_bool(keys::CAMERA, &value)?;
        }
        if let Some(value) = lookup(keys::INPUT_TRANSCRIPTION) {
            self.input_transcription = parse_bool(keys::INPUT_TRANSCRIPTION, &value)?;
        }
        if let Some(value) = lookup(keys::OUTPUT_TRANSCRIPTION) {
            self.output_transcription = parse_bool(keys::OUTPUT_TRANSCRIPTION, &value)?;
        }
        if let Some(value) = lookup(keys::TOOL_TIMEOUT_MS) {
            let ms: u64 = value.trim().parse().map_err(|_| {
                LiveError::Config(format!("{} must be milliseconds, got {:?}", keys::TOOL_TIMEOUT_MS, value))
            })?;
            self.tool_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(dir) = lookup(keys::RECORD_DIR) {
            self.record_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        Ok(())
    }

    /// Remember the user-facing choices so the next start picks them up.
    pub fn persist(&self, store: &mut dyn ConfigStore) -> Result<()> {
        store.set(keys::MODEL, &self.model)?;
        store.set(keys::VOICE, &self.voice)?;
        store.set(keys::CAMERA, if self.camera_enabled { "true" } else { "false" })?;
        if let Some(instruction) = &self.system_instruction {
            store.set(keys::SYSTEM_INSTRUCTION, instruction)?;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(LiveError::Config(format!("{} must be a boolean, got {:?}", key, other))),
    }
}

/// Persisted key/value store for session settings.
pub trait ConfigStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
}

/// A [`ConfigStore`] kept as a flat JSON object on disk.
///
/// Every `set` rewrites the file so a crash never loses an acknowledged write.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config store at {:?}, starting empty", path);
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        info!("Loaded {} config value(s) from {:?}", values.len(), path);
        Ok(Self { path, values })
    }
}

impl ConfigStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.values)?)?;
        Ok(())
    }
}
