//! mmlive - real-time voice (and optional video) sessions with the Gemini Live API
//!
//! The [`session::SessionController`] actor owns a session end to end:
//! microphone capture and PCM encoding, low-rate frame sampling, gapless
//! playback of the model's voice with barge-in, local tool execution and the
//! transcript log.

pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod media_in;
pub mod playback;
pub mod protocol;
pub mod recorder;
pub mod session;
pub mod speaker;
pub mod tools;
pub mod transcript;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ConfigStore, JsonFileStore, LiveConfig};
pub use error::{LiveError, Result};
pub use events::UiEvent;
pub use session::{SessionController, SessionHandle, SessionState, TeardownReport};
pub use tools::ToolRegistry;
