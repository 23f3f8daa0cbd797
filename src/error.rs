//! Error type shared by the live-session engine.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Why a capture or playback device could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("device busy")]
    Busy,

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Error type for live-session operations
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{kind} device error: {source}")]
    Device {
        kind: DeviceKind,
        #[source]
        source: DeviceError,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Session already running")]
    AlreadyRunning,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Recording error: {0}")]
    Recording(#[from] hound::Error),

    #[error("Channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, LiveError>;

/// Which kind of device a [`DeviceError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Microphone,
    Camera,
    Speaker,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Microphone => write!(f, "microphone"),
            DeviceKind::Camera => write!(f, "camera"),
            DeviceKind::Speaker => write!(f, "speaker"),
        }
    }
}

impl LiveError {
    pub fn device(kind: DeviceKind, source: DeviceError) -> Self {
        Self::Device { kind, source }
    }

    /// Whether this error must end the session.
    ///
    /// Camera failures degrade to audio-only and a single bad chunk is
    /// dropped. Everything touching the transport, the microphone or the
    /// speaker is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            LiveError::Device { kind: DeviceKind::Camera, .. }
                | LiveError::Protocol(_)
                | LiveError::Recording(_)
        )
    }
}
