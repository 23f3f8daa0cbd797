//! Session lifecycle actor.
//!
//! One [`SessionController`] task owns every piece of mutable session state.
//! Start/stop requests, transport callbacks, capture blocks, sampled frames,
//! playback completions and tool results all arrive on its inbox and are
//! handled to completion one at a time, so no locks guard the clock cursor,
//! the live source set or the session state.
//!
//! ```text
//! idle -> initializing -> active -> closing -> closed
//!              \             \
//!               +-------------+--> error
//! ```

use crate::config::LiveConfig;
use crate::devices::{self, AcquiredDevices, AutoGrant, DeviceProvider, PermissionPrompt};
use crate::error::{LiveError, Result};
use crate::events::{EventSender, SessionEvent, SessionId, SessionInput, TransportEvent, UiEvent, UiSink};
use crate::media_in::{spawn_frame_sampler, AudioCaptureEncoder, AudioInput, FrameSampler, VideoSource};
use crate::playback::{AudioOutput, InboundAudioBuffer, PlaybackScheduler};
use crate::protocol::{ClientMessage, InlineData, ServerEvent};
use crate::recorder::SessionRecorder;
use crate::tools::{Dispatch, ToolCallBridge, ToolRegistry, ToolResponse};
use crate::transcript::{TranscriptAggregator, TranscriptEntry, TranscriptRole};
use crate::transport::{build_setup, Connector, Transport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Active,
    Closing,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }
}

/// One start-to-teardown run. Never reused; a new start makes a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    /// Cleared when the camera could not be acquired.
    pub camera_enabled: bool,
    pub started_at: DateTime<Utc>,
    /// Latest resumption handle from the server. Kept, not acted on.
    pub resumption_handle: Option<String>,
}

/// Why a session is being torn down.
#[derive(Debug, Clone, PartialEq)]
pub enum TeardownCause {
    Stop,
    TransportClosed(Option<String>),
    TransportError(String),
    Failed(String),
}

impl TeardownCause {
    fn final_state(&self) -> SessionState {
        match self {
            TeardownCause::Stop | TeardownCause::TransportClosed(_) => SessionState::Closed,
            TeardownCause::TransportError(_) | TeardownCause::Failed(_) => SessionState::Error,
        }
    }
}

/// What the one teardown pass of a session did.
#[derive(Debug, Clone, PartialEq)]
pub struct TeardownReport {
    pub session_id: SessionId,
    pub cause: TeardownCause,
    pub final_state: SessionState,
    pub microphone_released: bool,
    pub camera_released: bool,
    pub speaker_closed: bool,
    /// Playback sources that were still live and got stopped.
    pub sources_stopped: usize,
    /// Tool calls still awaiting their handler when the session ended.
    pub orphaned_tool_calls: Vec<String>,
    pub transcript_entries: usize,
}

/// Everything owned by the current session. Each device handle is an
/// `Option` so teardown can take it, which makes a second release impossible.
struct SessionContext {
    session: Session,
    events: EventSender,
    microphone: Option<Box<dyn AudioInput>>,
    camera: Option<Arc<dyn VideoSource>>,
    speaker: Option<Box<dyn AudioOutput>>,
    transport: Option<Box<dyn Transport>>,
    sampler: Option<JoinHandle<()>>,
    scheduler: PlaybackScheduler,
    tools: ToolCallBridge,
    transcript: TranscriptAggregator,
    recorder: Option<SessionRecorder>,
}

impl SessionContext {
    fn send(&mut self, message: ClientMessage) -> Result<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.send(message),
            None => Err(LiveError::ConnectionClosed),
        }
    }
}

/// Cloneable handle for driving a controller running on its own task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: UnboundedSender<SessionInput>,
}

impl SessionHandle {
    pub fn start(&self) -> Result<()> {
        self.tx.send(SessionInput::Start).map_err(|_| LiveError::ChannelClosed)
    }

    pub fn stop(&self) -> Result<()> {
        self.tx.send(SessionInput::Stop).map_err(|_| LiveError::ChannelClosed)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.tx.send(SessionInput::Shutdown).map_err(|_| LiveError::ChannelClosed)
    }
}

pub struct SessionController {
    config: LiveConfig,
    devices: Arc<dyn DeviceProvider>,
    prompt: Arc<dyn PermissionPrompt>,
    connector: Arc<dyn Connector>,
    registry: Arc<ToolRegistry>,
    ui: Option<UiSink>,
    inbox: UnboundedSender<SessionInput>,
    current: Option<SessionContext>,
    last_report: Option<TeardownReport>,
}

impl SessionController {
    /// Create a controller and the receiving end of its inbox.
    pub fn new(
        config: LiveConfig,
        devices: Arc<dyn DeviceProvider>,
        connector: Arc<dyn Connector>,
        registry: Arc<ToolRegistry>,
    ) -> (Self, UnboundedReceiver<SessionInput>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            devices,
            prompt: Arc::new(AutoGrant),
            connector,
            registry,
            ui: None,
            inbox,
            current: None,
            last_report: None,
        };
        (controller, rx)
    }

    pub fn with_ui(mut self, ui: UiSink) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn with_permission_prompt(mut self, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle { tx: self.inbox.clone() }
    }

    /// Process inputs until [`SessionInput::Shutdown`]. Returns the report of
    /// the last session torn down, if any.
    pub async fn run(mut self, mut inbox: UnboundedReceiver<SessionInput>) -> Option<TeardownReport> {
        info!("Session controller started");
        while let Some(input) = inbox.recv().await {
            let shutdown = matches!(input, SessionInput::Shutdown);
            self.handle_input(input);
            if shutdown {
                break;
            }
        }
        info!("Session controller stopped");
        self.last_report
    }

    pub fn state(&self) -> SessionState {
        self.current.as_ref().map_or(SessionState::Idle, |ctx| ctx.session.state)
    }

    pub fn session(&self) -> Option<&Session> {
        self.current.as_ref().map(|ctx| &ctx.session)
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.current.as_ref().map(|ctx| ctx.transcript.entries()).unwrap_or(&[])
    }

    pub fn next_start_time(&self) -> f64 {
        self.current.as_ref().map_or(0.0, |ctx| ctx.scheduler.next_start_time())
    }

    pub fn live_sources(&self) -> usize {
        self.current.as_ref().map_or(0, |ctx| ctx.scheduler.live_count())
    }

    pub fn pending_tool_calls(&self) -> usize {
        self.current.as_ref().map_or(0, |ctx| ctx.tools.pending_count())
    }

    pub fn last_report(&self) -> Option<&TeardownReport> {
        self.last_report.as_ref()
    }

    pub fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Start => {
                if let Err(e) = self.start() {
                    warn!("Start rejected: {}", e);
                    self.notify(UiEvent::Error(e.to_string()));
                }
            }
            SessionInput::Stop => {
                self.teardown(TeardownCause::Stop);
            }
            SessionInput::Shutdown => {
                self.teardown(TeardownCause::Stop);
            }
            SessionInput::Session { id, event } => self.handle_session_event(id, event),
        }
    }

    fn notify(&self, event: UiEvent) {
        if let Some(ui) = &self.ui {
            let _ = ui.send(event);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if let Some(ctx) = self.current.as_mut() {
            if ctx.session.state != state {
                info!("Session {}: {:?} -> {:?}", ctx.session.id, ctx.session.state, state);
                ctx.session.state = state;
            }
        }
        self.notify(UiEvent::ConnectionState(state));
    }

    fn start(&mut self) -> Result<()> {
        if self.current.as_ref().is_some_and(|ctx| !ctx.session.state.is_terminal()) {
            return Err(LiveError::AlreadyRunning);
        }

        let id = SessionId::generate();
        let events = EventSender::new(id.clone(), self.inbox.clone());
        info!("Starting session {} (camera requested: {})", id, self.config.camera_enabled);

        let recorder = match &self.config.record_dir {
            Some(root) => match SessionRecorder::create(root, &id) {
                Ok(recorder) => Some(recorder),
                Err(e) => {
                    warn!("Recording disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        self.current = Some(SessionContext {
            session: Session {
                id,
                state: SessionState::Idle,
                camera_enabled: self.config.camera_enabled,
                started_at: Utc::now(),
                resumption_handle: None,
            },
            events: events.clone(),
            microphone: None,
            camera: None,
            speaker: None,
            transport: None,
            sampler: None,
            scheduler: PlaybackScheduler::new(),
            tools: ToolCallBridge::new(self.registry.clone(), self.config.tool_timeout),
            transcript: TranscriptAggregator::new(),
            recorder,
        });
        self.set_state(SessionState::Initializing);

        // Opening devices may block on the sound server; the result comes back
        // through the inbox like any other event.
        let provider = self.devices.clone();
        let prompt = self.prompt.clone();
        let want_camera = self.config.camera_enabled;
        let block_size = self.config.capture_block_size;
        tokio::task::spawn_blocking(move || {
            let acquired = devices::acquire(provider.as_ref(), prompt.as_ref(), want_camera, block_size, events.clone());
            events.send(SessionEvent::DevicesAcquired(acquired));
        });

        Ok(())
    }

    fn handle_session_event(&mut self, id: SessionId, event: SessionEvent) {
        let is_current = self
            .current
            .as_ref()
            .is_some_and(|ctx| ctx.session.id == id && !ctx.session.state.is_terminal());

        if !is_current {
            // Devices opened for a session that is already gone still need closing.
            if let SessionEvent::DevicesAcquired(Ok(devices)) = event {
                info!("Releasing devices that arrived after session {} ended", id);
                devices.release();
            } else {
                debug!("Dropping stale event for session {}", id);
            }
            return;
        }

        match event {
            SessionEvent::DevicesAcquired(result) => self.on_devices(result),
            SessionEvent::Transport(event) => self.on_transport(event),
            SessionEvent::Audio(chunk) => {
                let Some(ctx) = self.current.as_mut() else { return };
                if ctx.session.state != SessionState::Active {
                    return;
                }
                if let Some(recorder) = ctx.recorder.as_mut() {
                    if let Err(e) = recorder.write_input(&chunk.pcm_bytes) {
                        debug!("Recorder dropped input block: {}", e);
                    }
                }
                if let Err(e) = ctx.send(ClientMessage::audio(chunk.to_blob())) {
                    debug!("Dropping audio chunk: {}", e);
                }
            }
            SessionEvent::Frame(chunk) => {
                let Some(ctx) = self.current.as_mut() else { return };
                if ctx.session.state != SessionState::Active || !ctx.session.camera_enabled {
                    return;
                }
                if let Err(e) = ctx.send(ClientMessage::video(chunk.to_blob())) {
                    debug!("Dropping frame: {}", e);
                }
            }
            SessionEvent::PlaybackEnded(source) => {
                if let Some(ctx) = self.current.as_mut() {
                    ctx.scheduler.on_ended(source);
                }
            }
            SessionEvent::ToolFinished(response) => self.on_tool_finished(response),
        }
    }

    fn on_devices(&mut self, result: std::result::Result<AcquiredDevices, LiveError>) {
        let mut acquired = match result {
            Ok(acquired) => acquired,
            Err(e) => {
                self.on_error("Device acquisition", e);
                return;
            }
        };

        let setup = build_setup(&self.config, self.registry.declarations());
        let Some(ctx) = self.current.as_mut() else {
            acquired.release();
            return;
        };
        if ctx.session.state != SessionState::Initializing {
            acquired.release();
            return;
        }

        let camera_warning = acquired.camera_error.take().map(|e| {
            ctx.session.camera_enabled = false;
            format!("Camera unavailable ({}), continuing with audio only", e)
        });
        if ctx.session.camera_enabled && acquired.camera.is_none() {
            ctx.session.camera_enabled = false;
        }
        ctx.microphone = Some(acquired.microphone);
        ctx.speaker = Some(acquired.speaker);
        ctx.camera = acquired.camera;
        let events = ctx.events.clone();

        if let Some(warning) = camera_warning {
            self.notify(UiEvent::Warning(warning));
        }

        match self.connector.connect(setup, events) {
            Ok(transport) => {
                if let Some(ctx) = self.current.as_mut() {
                    ctx.transport = Some(transport);
                }
            }
            Err(e) => {
                error!("Failed to connect: {}", e);
                self.teardown(TeardownCause::TransportError(e.to_string()));
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Message(batch) => {
                for event in batch {
                    self.on_server_event(event);
                    if self.state().is_terminal() {
                        break;
                    }
                }
            }
            TransportEvent::Close { reason } => {
                info!("Transport closed: {}", reason.as_deref().unwrap_or("no reason"));
                self.teardown(TeardownCause::TransportClosed(reason));
            }
            TransportEvent::Error(message) => {
                error!("Transport error: {}", message);
                self.teardown(TeardownCause::TransportError(message));
            }
        }
    }

    fn on_open(&mut self) {
        let Some(ctx) = self.current.as_mut() else { return };
        if ctx.session.state != SessionState::Initializing {
            debug!("Ignoring open in state {:?}", ctx.session.state);
            return;
        }

        let encoder = AudioCaptureEncoder::new(self.config.capture_block_size);
        let started = match ctx.microphone.as_mut() {
            Some(microphone) => microphone.start(encoder, ctx.events.clone()),
            None => Err(LiveError::SetupNotComplete),
        };
        if let Err(e) = started {
            self.on_error("Microphone capture", e);
            if self.state().is_terminal() {
                return;
            }
        }
        let Some(ctx) = self.current.as_mut() else { return };

        if ctx.session.camera_enabled {
            if let Some(camera) = ctx.camera.clone() {
                ctx.sampler = Some(spawn_frame_sampler(
                    camera,
                    FrameSampler::new(self.config.frame_width, self.config.jpeg_quality),
                    self.config.frame_interval,
                    ctx.events.clone(),
                ));
            }
        }

        self.set_state(SessionState::Active);
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        let Some(ctx) = self.current.as_mut() else { return };

        match event {
            ServerEvent::SetupComplete => debug!("Duplicate setupComplete ignored"),
            ServerEvent::ToolCall(call) => match ctx.tools.accept(call, &ctx.events) {
                Dispatch::Running { name } => self.notify(UiEvent::ToolExecuting { name, active: true }),
                Dispatch::Immediate(response) => self.respond(response),
                Dispatch::Duplicate => {}
            },
            ServerEvent::ToolCallCancellation(ids) => {
                for (_, name) in ctx.tools.cancel(&ids) {
                    self.notify(UiEvent::ToolExecuting { name, active: false });
                }
            }
            ServerEvent::InputTranscription(text) => {
                let entry = ctx.transcript.push(TranscriptRole::Input, text).clone();
                self.notify(UiEvent::Transcript(entry));
            }
            ServerEvent::OutputTranscription(text) => {
                let entry = ctx.transcript.push(TranscriptRole::Output, text).clone();
                self.notify(UiEvent::Transcript(entry));
            }
            ServerEvent::Audio(inline) => {
                if let Err(e) = Self::play(ctx, inline) {
                    self.on_error("Audio playback", e);
                }
            }
            ServerEvent::Text(text) => debug!("Model text: {}", text),
            ServerEvent::Interrupted => {
                let stopped = match ctx.speaker.as_mut() {
                    Some(speaker) => ctx.scheduler.interrupt(speaker.as_mut()),
                    None => {
                        ctx.scheduler.reset();
                        0
                    }
                };
                info!("Interrupted, flushed {} source(s)", stopped);
            }
            ServerEvent::GenerationComplete => debug!("Generation complete"),
            ServerEvent::TurnComplete => debug!("Turn complete"),
            ServerEvent::GoAway { time_left } => {
                let message = format!(
                    "Server is ending the session (time left: {})",
                    time_left.as_deref().unwrap_or("unknown")
                );
                warn!("{}", message);
                self.notify(UiEvent::Warning(message));
            }
            ServerEvent::SessionResumption(handle) => {
                debug!("Stored session resumption handle");
                ctx.session.resumption_handle = Some(handle);
            }
        }
    }

    fn play(ctx: &mut SessionContext, inline: InlineData) -> Result<()> {
        let buffer = InboundAudioBuffer::from_base64(&inline.data)?;
        if let Some(recorder) = ctx.recorder.as_mut() {
            if let Err(e) = recorder.write_output(&buffer.to_pcm16()) {
                debug!("Recorder dropped output chunk: {}", e);
            }
        }
        let Some(speaker) = ctx.speaker.as_mut() else {
            debug!("No speaker, dropping audio chunk");
            return Ok(());
        };
        ctx.scheduler.schedule(speaker.as_mut(), buffer)?;
        Ok(())
    }

    /// Fatal errors end the session; anything else only costs the chunk or
    /// feature that hit it.
    fn on_error(&mut self, what: &str, e: LiveError) {
        if e.is_fatal() {
            error!("{} failed: {}", what, e);
            self.teardown(TeardownCause::Failed(e.to_string()));
        } else {
            warn!("{} failed, continuing: {}", what, e);
        }
    }

    fn on_tool_finished(&mut self, response: ToolResponse) {
        let Some(ctx) = self.current.as_mut() else { return };
        if let Some(response) = ctx.tools.complete(response) {
            self.notify(UiEvent::ToolExecuting {
                name: response.name.clone(),
                active: false,
            });
            self.respond(response);
        }
    }

    fn respond(&mut self, response: ToolResponse) {
        let Some(ctx) = self.current.as_mut() else { return };
        debug!("Sending tool response for {} ({})", response.id, response.name);
        if let Err(e) = ctx.send(ClientMessage::tool_responses(vec![response.into_function_response()])) {
            warn!("Failed to send tool response: {}", e);
        }
    }

    /// Release everything the current session holds. Safe from any state;
    /// a session that is already closed or failed is left alone.
    fn teardown(&mut self, cause: TeardownCause) -> Option<TeardownReport> {
        let ctx = self.current.as_mut()?;
        if ctx.session.state.is_terminal() {
            debug!("Session {} already torn down", ctx.session.id);
            return None;
        }
        info!("Tearing down session {} ({:?})", ctx.session.id, cause);
        self.set_state(SessionState::Closing);
        let ctx = self.current.as_mut()?;

        let microphone_released = match ctx.microphone.take() {
            Some(mut microphone) => {
                microphone.release();
                true
            }
            None => false,
        };

        if let Some(sampler) = ctx.sampler.take() {
            sampler.abort();
        }
        let camera_released = match ctx.camera.take() {
            Some(camera) => {
                camera.release();
                true
            }
            None => false,
        };

        let (sources_stopped, speaker_closed) = match ctx.speaker.take() {
            Some(mut speaker) => {
                let stopped = ctx.scheduler.interrupt(speaker.as_mut());
                speaker.close();
                (stopped, true)
            }
            None => {
                ctx.scheduler.reset();
                (0, false)
            }
        };

        let orphaned = ctx.tools.drain_pending();
        if !orphaned.is_empty() {
            if cause == TeardownCause::Stop && ctx.transport.is_some() {
                let responses = orphaned
                    .iter()
                    .map(|(id, name)| ToolResponse::error(id.clone(), name.clone(), "session closing").into_function_response())
                    .collect();
                if let Err(e) = ctx.send(ClientMessage::tool_responses(responses)) {
                    warn!("Failed to answer pending tool calls: {}", e);
                }
            } else {
                warn!(
                    "Session ended with {} unanswered tool call(s): {:?}",
                    orphaned.len(),
                    orphaned.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>()
                );
            }
        }

        if let Some(mut transport) = ctx.transport.take() {
            transport.close();
        }

        if let Some(recorder) = ctx.recorder.take() {
            match recorder.finalize() {
                Ok(dir) => info!("Recording saved to {:?}", dir),
                Err(e) => warn!("Failed to finalize recording: {}", e),
            }
        }

        let report = TeardownReport {
            session_id: ctx.session.id.clone(),
            final_state: cause.final_state(),
            microphone_released,
            camera_released,
            speaker_closed,
            sources_stopped,
            orphaned_tool_calls: orphaned.into_iter().map(|(id, _)| id).collect(),
            transcript_entries: ctx.transcript.entries().len(),
            cause,
        };

        match &report.cause {
            TeardownCause::TransportError(message) | TeardownCause::Failed(message) => {
                self.notify(UiEvent::Error(message.clone()));
            }
            TeardownCause::Stop | TeardownCause::TransportClosed(_) => {}
        }
        self.set_state(report.final_state);
        info!("Session {} torn down: {:?}", report.session_id, report);

        self.last_report = Some(report.clone());
        Some(report)
    }
}
