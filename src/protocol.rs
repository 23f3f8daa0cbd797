//! Wire messages for the Live API websocket.
//!
//! Outbound traffic is a [`ClientMessage`]; inbound frames parse into a
//! [`ServerMessage`] whose optional fields are flattened into an ordered batch
//! of [`ServerEvent`]s so the session can dispatch with exhaustive matching.
//!
//! Inbound fields are decoded one by one: a malformed field or list entry is
//! dropped on its own and the rest of the message still goes through.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use tracing::debug;

pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";
pub const IMAGE_MIME: &str = "image/jpeg";

/// Base64 payload plus its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub data: String,
    pub mime_type: String,
}

/// Message sent from client to server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponseMessage),
}

impl ClientMessage {
    pub fn audio(blob: MediaBlob) -> Self {
        Self::RealtimeInput(RealtimeInput {
            audio: Some(blob),
            video: None,
        })
    }

    pub fn video(blob: MediaBlob) -> Self {
        Self::RealtimeInput(RealtimeInput {
            audio: None,
            video: Some(blob),
        })
    }

    pub fn tool_responses(function_responses: Vec<FunctionResponse>) -> Self {
        Self::ToolResponse(ToolResponseMessage { function_responses })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Session setup message.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
}

/// Serializes as `{}`; presence of the field is the flag.
#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SpeechConfig {
    pub fn voice(name: impl Into<String>) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig { voice_name: name.into() },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![TextPart { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Name plus JSON-schema parameters of a locally handled function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaBlob>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponseMessage {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// Decode a field on its own, treating a malformed value as absent.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_else(|e| {
        debug!("Ignoring malformed field: {}", e);
        T::default()
    }))
}

/// Decode a list entry by entry, skipping the malformed ones.
fn lenient_items<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        debug!("Ignoring non-list field");
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| {
            serde_json::from_value(item)
                .map_err(|e| debug!("Skipping malformed entry: {}", e))
                .ok()
        })
        .collect())
}

/// A function call requested by the model.
///
/// A missing `name` decodes as empty so the call can still be answered with
/// an error under its id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Server -> client message. Any subset of fields may be present.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default, deserialize_with = "lenient")]
    pub server_content: Option<ServerContent>,
    #[serde(default, deserialize_with = "lenient")]
    pub tool_call: Option<ToolCallMessage>,
    #[serde(default, deserialize_with = "lenient")]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default, deserialize_with = "lenient")]
    pub go_away: Option<GoAway>,
    #[serde(default, deserialize_with = "lenient")]
    pub session_resumption_update: Option<SessionResumptionUpdate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, deserialize_with = "lenient")]
    pub model_turn: Option<ModelTurn>,
    #[serde(default, deserialize_with = "lenient")]
    pub input_transcription: Option<Transcription>,
    #[serde(default, deserialize_with = "lenient")]
    pub output_transcription: Option<Transcription>,
    #[serde(default, deserialize_with = "lenient")]
    pub interrupted: bool,
    #[serde(default, deserialize_with = "lenient")]
    pub turn_complete: bool,
    #[serde(default, deserialize_with = "lenient")]
    pub generation_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default, deserialize_with = "lenient_items")]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, deserialize_with = "lenient")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub data: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    #[serde(default, deserialize_with = "lenient_items")]
    pub function_calls: Vec<ToolCall>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default, deserialize_with = "lenient_items")]
    pub ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumptionUpdate {
    #[serde(default)]
    pub new_handle: Option<String>,
    #[serde(default)]
    pub resumable: bool,
}

/// One inbound occurrence, dispatched by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    ToolCall(ToolCall),
    ToolCallCancellation(Vec<String>),
    /// The caller's speech, as recognised by the service.
    InputTranscription(String),
    /// The service's own synthesized reply, as text.
    OutputTranscription(String),
    /// Base64 PCM at 24 kHz mono.
    Audio(InlineData),
    Text(String),
    Interrupted,
    GenerationComplete,
    TurnComplete,
    GoAway { time_left: Option<String> },
    SessionResumption(String),
}

pub type ServerEvents = SmallVec<[ServerEvent; 4]>;

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Flatten into events.
    ///
    /// An interruption is emitted before any audio carried by the same
    /// message so that audio is scheduled against the reset cursor.
    pub fn into_events(self) -> ServerEvents {
        let mut events = ServerEvents::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }
        if let Some(cancellation) = self.tool_call_cancellation {
            if !cancellation.ids.is_empty() {
                events.push(ServerEvent::ToolCallCancellation(cancellation.ids));
            }
        }
        if let Some(tool_call) = self.tool_call {
            events.extend(tool_call.function_calls.into_iter().map(ServerEvent::ToolCall));
        }
        if let Some(content) = self.server_content {
            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }
            if let Some(text) = content.input_transcription.and_then(|t| t.text) {
                events.push(ServerEvent::InputTranscription(text));
            }
            if let Some(text) = content.output_transcription.and_then(|t| t.text) {
                events.push(ServerEvent::OutputTranscription(text));
            }
            for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
                if let Some(inline) = part.inline_data {
                    match inline.mime_type.as_deref() {
                        Some(mime) if !mime.starts_with("audio/") => {
                            debug!("Skipping inline {} part", mime);
                        }
                        _ => events.push(ServerEvent::Audio(inline)),
                    }
                } else if let Some(text) = part.text {
                    events.push(ServerEvent::Text(text));
                }
            }
            if content.generation_complete {
                events.push(ServerEvent::GenerationComplete);
            }
            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }
        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway {
                time_left: go_away.time_left,
            });
        }
        if let Some(handle) = self.session_resumption_update.and_then(|u| u.new_handle) {
            events.push(ServerEvent::SessionResumption(handle));
        }

        events
    }
}
