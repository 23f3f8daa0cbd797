//! Live API websocket transport.
//!
//! `connect` returns immediately with a [`Transport`] handle; the connection is
//! driven by a spawned task that reports back through the session's
//! [`EventSender`]:
//!
//! - [`TransportEvent::Open`] once the server acknowledged `setup`
//! - [`TransportEvent::Message`] for every parsed frame after that
//! - [`TransportEvent::Close`] / [`TransportEvent::Error`] exactly once at the end,
//!   unless the session closed the transport itself

use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::events::{EventSender, SessionEvent, TransportEvent};
use crate::protocol::{
    ClientMessage, Content, Empty, FunctionDeclaration, GenerationConfig, ServerEvent, ServerEvents, ServerMessage,
    Setup, SpeechConfig, Tool,
};
use futures_util::{SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Outbound half of a connection, owned by the session.
pub trait Transport: Send {
    fn send(&mut self, message: ClientMessage) -> Result<()>;

    /// Close the connection. No further events are reported for it.
    fn close(&mut self);
}

/// Opens connections. Must be called from within a tokio runtime.
pub trait Connector: Send + Sync {
    fn connect(&self, setup: Setup, events: EventSender) -> Result<Box<dyn Transport>>;
}

/// The `setup` message for a session: audio responses in the configured voice,
/// the system instruction, the registered tools and the transcription flags.
pub fn build_setup(config: &LiveConfig, declarations: Vec<FunctionDeclaration>) -> Setup {
    Setup {
        model: config.model.clone(),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: Some(SpeechConfig::voice(config.voice.clone())),
        },
        system_instruction: config.system_instruction.as_ref().map(Content::text),
        tools: if declarations.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations: declarations,
            }]
        },
        input_audio_transcription: config.input_transcription.then_some(Empty {}),
        output_audio_transcription: config.output_transcription.then_some(Empty {}),
    }
}

/// What one websocket frame means to the session.
#[derive(Debug, PartialEq)]
enum Frame {
    Events(ServerEvents),
    Close(Option<String>),
    Skip,
}

fn decode_frame(message: Message) -> Frame {
    let text = match &message {
        Message::Text(text) => text.as_str(),
        // The service sends JSON in binary frames too.
        Message::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                debug!("Dropping non-UTF-8 binary frame ({} bytes)", bytes.len());
                return Frame::Skip;
            }
        },
        Message::Close(frame) => {
            return Frame::Close(
                frame
                    .as_ref()
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|reason| !reason.is_empty()),
            )
        }
        _ => return Frame::Skip,
    };

    match ServerMessage::parse(text) {
        Ok(parsed) => Frame::Events(parsed.into_events()),
        Err(e) => {
            debug!("Dropping unparseable server message: {}", e);
            Frame::Skip
        }
    }
}

/// Connects with `tokio-tungstenite` and exchanges JSON text frames.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    setup_timeout: Duration,
}

impl WsConnector {
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            url: config.url(),
            setup_timeout: config.setup_timeout,
        }
    }
}

enum Outgoing {
    Message(ClientMessage),
    Close,
}

struct WsTransport {
    tx: UnboundedSender<Outgoing>,
}

impl Transport for WsTransport {
    fn send(&mut self, message: ClientMessage) -> Result<()> {
        self.tx
            .send(Outgoing::Message(message))
            .map_err(|_| LiveError::ConnectionClosed)
    }

    fn close(&mut self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

impl Connector for WsConnector {
    fn connect(&self, setup: Setup, events: EventSender) -> Result<Box<dyn Transport>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = self.url.clone();
        let setup_timeout = self.setup_timeout;

        tokio::spawn(async move {
            if let Err(e) = run_connection(url, setup, setup_timeout, rx, &events).await {
                error!("Live API connection failed: {}", e);
                events.send(SessionEvent::Transport(TransportEvent::Error(e.to_string())));
            }
        });

        Ok(Box::new(WsTransport { tx }))
    }
}

async fn run_connection(
    url: String,
    setup: Setup,
    setup_timeout: Duration,
    mut outgoing: UnboundedReceiver<Outgoing>,
    events: &EventSender,
) -> Result<()> {
    let handshake = async {
        info!("Connecting to Live API");
        let (ws_stream, resp) = connect_async(url.as_str()).await?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, mut stream) = ws_stream.split();
        let setup_json = ClientMessage::Setup(setup).to_json()?;
        sink.send(Message::Text(setup_json.into())).await?;
        debug!("Setup sent, waiting for acknowledgement");

        let early = await_setup(&mut stream).await?;
        Ok::<_, LiveError>((sink, stream, early))
    };

    let (mut sink, mut stream, early) = tokio::time::timeout(setup_timeout, handshake)
        .await
        .map_err(|_| LiveError::Timeout(format!("setup not acknowledged within {}ms", setup_timeout.as_millis())))??;

    info!("Live API setup complete");
    if !events.send(SessionEvent::Transport(TransportEvent::Open)) {
        return Ok(());
    }
    if !early.is_empty() {
        events.send(SessionEvent::Transport(TransportEvent::Message(early)));
    }

    loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(Outgoing::Message(message)) => {
                    let json = message.to_json()?;
                    sink.send(Message::Text(json.into())).await?;
                }
                Some(Outgoing::Close) | None => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!("Close frame not sent: {}", e);
                    }
                    info!("Live API connection closed by client");
                    return Ok(());
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(frame)) => match decode_frame(frame) {
                    Frame::Events(batch) => {
                        if !batch.is_empty() && !events.send(SessionEvent::Transport(TransportEvent::Message(batch))) {
                            return Ok(());
                        }
                    }
                    Frame::Close(reason) => {
                        info!("Live API closed the connection: {}", reason.as_deref().unwrap_or("no reason"));
                        events.send(SessionEvent::Transport(TransportEvent::Close { reason }));
                        return Ok(());
                    }
                    Frame::Skip => {}
                },
                Some(Err(e)) => return Err(e.into()),
                None => {
                    info!("Live API stream ended");
                    events.send(SessionEvent::Transport(TransportEvent::Close { reason: None }));
                    return Ok(());
                }
            },
        }
    }
}

/// Read until `setupComplete`. Anything that arrived in the same frame after
/// it is returned for normal dispatch.
async fn await_setup<S>(stream: &mut S) -> Result<ServerEvents>
where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match decode_frame(frame?) {
            Frame::Events(mut batch) => {
                if let Some(at) = batch.iter().position(|e| *e == ServerEvent::SetupComplete) {
                    batch.remove(at);
                    return Ok(batch);
                }
                debug!("Ignoring {} event(s) before setupComplete", batch.len());
            }
            Frame::Close(reason) => {
                warn!("Connection closed during setup: {}", reason.as_deref().unwrap_or("no reason"));
                return Err(LiveError::SetupNotComplete);
            }
            Frame::Skip => {}
        }
    }
    Err(LiveError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolCall;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    type WsResult = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>;

    fn text(value: serde_json::Value) -> Message {
        Message::Text(value.to_string().into())
    }

    #[test]
    fn setup_carries_config_and_tools() {
        let config = LiveConfig {
            system_instruction: Some("be brief".to_string()),
            output_transcription: false,
            ..Default::default()
        };
        let setup = build_setup(
            &config,
            vec![FunctionDeclaration {
                name: "lookup".to_string(),
                description: String::new(),
                parameters: json!({"type": "object"}),
            }],
        );

        assert_eq!(setup.model, config.model);
        assert_eq!(setup.generation_config.response_modalities, vec!["AUDIO"]);
        assert_eq!(setup.tools[0].function_declarations[0].name, "lookup");
        assert!(setup.system_instruction.is_some());
        assert!(setup.input_audio_transcription.is_some());
        assert!(setup.output_audio_transcription.is_none());

        assert!(build_setup(&config, Vec::new()).tools.is_empty());
    }

    #[test]
    fn text_and_binary_frames_parse_alike() {
        let body = json!({"serverContent": {"turnComplete": true}});
        let expected = Frame::Events(ServerEvents::from_vec(vec![ServerEvent::TurnComplete]));

        assert_eq!(decode_frame(text(body.clone())), expected);
        assert_eq!(decode_frame(Message::Binary(body.to_string().into_bytes().into())), expected);
    }

    #[test]
    fn bad_frames_are_skipped() {
        assert_eq!(decode_frame(Message::Text("{nope".into())), Frame::Skip);
        assert_eq!(decode_frame(Message::Binary(vec![0xff, 0xfe].into())), Frame::Skip);
        assert_eq!(decode_frame(Message::Ping(Vec::new().into())), Frame::Skip);
    }

    #[test]
    fn close_frame_reason() {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: "API key not valid".into(),
        };
        assert_eq!(
            decode_frame(Message::Close(Some(frame))),
            Frame::Close(Some("API key not valid".to_string()))
        );
        assert_eq!(decode_frame(Message::Close(None)), Frame::Close(None));
    }

    #[tokio::test]
    async fn setup_acknowledgement_keeps_trailing_events() {
        let frames: Vec<WsResult> = vec![
            Ok(Message::Ping(Vec::new().into())),
            Ok(text(json!({
                "setupComplete": {},
                "toolCall": {"functionCalls": [{"id": "1", "name": "now"}]}
            }))),
        ];
        let mut stream = futures_util::stream::iter(frames);

        let early = await_setup(&mut stream).await.unwrap();
        assert_eq!(
            early.into_vec(),
            vec![ServerEvent::ToolCall(ToolCall {
                id: "1".to_string(),
                name: "now".to_string(),
                args: serde_json::Value::Null,
            })]
        );
    }

    #[tokio::test]
    async fn close_before_setup_is_an_error() {
        let frames: Vec<WsResult> = vec![Ok(Message::Close(None))];
        let mut stream = futures_util::stream::iter(frames);
        assert!(matches!(await_setup(&mut stream).await, Err(LiveError::SetupNotComplete)));

        let mut empty = futures_util::stream::iter(Vec::<WsResult>::new());
        assert!(matches!(await_setup(&mut empty).await, Err(LiveError::ConnectionClosed)));
    }
}
