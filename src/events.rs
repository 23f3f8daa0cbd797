//! Messages flowing into the session actor and out to the UI layer.

use crate::devices::AcquiredDevices;
use crate::error::LiveError;
use crate::media_in::{OutboundAudioChunk, OutboundImageChunk};
use crate::playback::SourceId;
use crate::protocol::ServerEvents;
use crate::session::SessionState;
use crate::tools::ToolResponse;
use crate::transcript::TranscriptEntry;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

/// Identifier of one start-to-teardown session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        use rand::Rng;
        Self(format!("session-{:016x}", rand::rng().random::<u64>()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport callbacks: open, message, close, error.
#[derive(Debug)]
pub enum TransportEvent {
    Open,
    Message(ServerEvents),
    Close { reason: Option<String> },
    Error(String),
}

/// Events produced on behalf of one session.
#[derive(Debug)]
pub enum SessionEvent {
    DevicesAcquired(Result<AcquiredDevices, LiveError>),
    Transport(TransportEvent),
    Audio(OutboundAudioChunk),
    Frame(OutboundImageChunk),
    PlaybackEnded(SourceId),
    ToolFinished(ToolResponse),
}

/// The session actor's inbox.
#[derive(Debug)]
pub enum SessionInput {
    Start,
    Stop,
    /// Tear down whatever is live and end the actor loop.
    Shutdown,
    Session { id: SessionId, event: SessionEvent },
}

/// Producer-side handle that tags every event with the session it belongs to,
/// so events from a torn-down session are recognised and dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    session_id: SessionId,
    tx: UnboundedSender<SessionInput>,
}

impl EventSender {
    pub fn new(session_id: SessionId, tx: UnboundedSender<SessionInput>) -> Self {
        Self { session_id, tx }
    }

    /// Returns false once the actor has gone away.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx
            .send(SessionInput::Session {
                id: self.session_id.clone(),
                event,
            })
            .is_ok()
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    ConnectionState(SessionState),
    Transcript(TranscriptEntry),
    /// Pulse while a tool handler runs.
    ToolExecuting { name: String, active: bool },
    Error(String),
    Warning(String),
}

pub type UiSink = UnboundedSender<UiEvent>;
