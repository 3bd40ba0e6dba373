//! Wire protocol between the bridge and the agent backend.
//!
//! Two inbound shapes coexist on the socket: the structured envelope
//! (`{type, timestamp, conversation_state?, data}`) that carries the primary
//! protocol, and a legacy agent-native passthrough shape
//! (`{content: {parts}, partial?, author?}`) kept for backward compatibility.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sample rate of audio sent to the backend (microphone path).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of audio received from the backend (playback path).
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Tool names the backend invokes that carry recognized payload shapes.
pub mod tools {
    pub const GENERATE_EXPERIMENT: &str = "generate_experiment";
    pub const MODIFY_EXPERIMENT: &str = "modify_experiment";
    pub const CREATE_COMPARISON: &str = "create_comparison";
    pub const EXPLAIN_CONCEPT: &str = "explain_concept";
    pub const RESET_CANVAS: &str = "reset_canvas";
}

/// Messages sent from the bridge to the backend as JSON text frames.
/// Raw microphone audio normally travels as binary frames instead.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Alternate audio path: base64 PCM16 at the capture rate.
    Audio { data: String, mime_type: String },
    /// A plain text message from the user.
    Text { content: String },
    /// Best-effort close intent, sent just before closing the socket.
    Close,
}

impl ClientMessage {
    pub fn audio(data: String) -> Self {
        ClientMessage::Audio {
            data,
            mime_type: format!("audio/pcm;rate={CAPTURE_SAMPLE_RATE}"),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        ClientMessage::Text {
            content: content.into(),
        }
    }
}

/// Backend-reported conversation fields, piggybacked on any envelope.
/// Fields present here are applied verbatim; absent fields leave the local
/// state unchanged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConversationSnapshot {
    #[serde(default)]
    pub current_agent: Option<String>,
    #[serde(default)]
    pub turn_count: Option<u32>,
    #[serde(default)]
    pub is_processing_tool: Option<bool>,
}

/// One decoded structured envelope from the backend.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub timestamp: Option<f64>,
    pub conversation_state: Option<ConversationSnapshot>,
    pub payload: EventPayload,
}

/// The `data` payload of a structured envelope, one variant per enumerated
/// `type`. Dispatch over this enum is compile-time exhaustive.
#[derive(Debug, Clone)]
pub enum EventPayload {
    ToolExecutionStart(ToolStart),
    ToolExecutionComplete(ToolComplete),
    TextChunk(TextChunk),
    AgentActive(AgentActive),
    AgentTransition(AgentTransition),
    Interrupted,
    TurnComplete(TurnComplete),
    UserTranscription(Transcription),
    ModelTranscription(Transcription),
    Error(BackendError),
    /// Legacy inline audio event; body matches the binary path after decode.
    Audio(AudioChunk),
    /// Legacy plain-text event.
    Text(LegacyText),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolStart {
    pub tool_name: String,
    #[serde(default)]
    pub args: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolComplete {
    pub tool_name: String,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TextChunk {
    #[serde(default)]
    pub text: String,
    /// Accumulated full text for the current run, when the backend provides it.
    #[serde(default)]
    pub full_text: Option<String>,
    /// May arrive as null; coerced to false downstream.
    #[serde(default)]
    pub partial: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentActive {
    pub agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentTransition {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TurnComplete {
    #[serde(default)]
    pub turn_number: Option<u32>,
    #[serde(default)]
    pub interrupted: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub is_final: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioChunk {
    pub data: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LegacyText {
    #[serde(default, alias = "text")]
    pub content: String,
}

/// The legacy agent-native event shape, passed through by older backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeEvent {
    #[serde(default)]
    pub content: Option<NativeContent>,
    #[serde(default)]
    pub partial: Option<bool>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub output_transcription: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NativeContent {
    #[serde(default)]
    pub parts: Vec<NativePart>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NativePart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thought: Option<bool>,
    #[serde(default)]
    pub inline_data: Option<InlineBlob>,
    #[serde(default)]
    pub function_call: Option<Value>,
    #[serde(default)]
    pub function_response: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineBlob {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

/// A classified inbound text frame.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Event(ServerEvent),
    Native(NativeEvent),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unrecognized event type `{0}`")]
    UnknownType(String),
    #[error("message shape is neither an envelope nor a native event")]
    UnknownShape,
}

/// Classifies one inbound text frame into an envelope or a native event.
///
/// Unknown envelope types and malformed payloads are reported as errors so
/// the caller can log and continue; one bad message never kills the session.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    if let Some(kind) = value.get("type").and_then(Value::as_str) {
        let kind = kind.to_owned();
        let timestamp = value.get("timestamp").and_then(Value::as_f64);
        let conversation_state = value
            .get("conversation_state")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        let payload = EventPayload::from_wire(&kind, data)?;
        return Ok(InboundMessage::Event(ServerEvent {
            timestamp,
            conversation_state,
            payload,
        }));
    }
    if value.get("content").is_some() || value.get("outputTranscription").is_some() {
        let native = serde_json::from_value(value)?;
        return Ok(InboundMessage::Native(native));
    }
    Err(ProtocolError::UnknownShape)
}

impl EventPayload {
    fn from_wire(kind: &str, data: Value) -> Result<Self, ProtocolError> {
        // A missing `data` field decodes through each payload's defaults.
        let data = if data.is_null() {
            Value::Object(Default::default())
        } else {
            data
        };
        let payload = match kind {
            "tool_execution_start" => Self::ToolExecutionStart(serde_json::from_value(data)?),
            "tool_execution_complete" => Self::ToolExecutionComplete(serde_json::from_value(data)?),
            "text_chunk" => Self::TextChunk(serde_json::from_value(data)?),
            "agent_active" => Self::AgentActive(serde_json::from_value(data)?),
            "agent_transition" => Self::AgentTransition(serde_json::from_value(data)?),
            "interrupted" => Self::Interrupted,
            "turn_complete" => Self::TurnComplete(serde_json::from_value(data)?),
            "user_transcription" => Self::UserTranscription(serde_json::from_value(data)?),
            "model_transcription" => Self::ModelTranscription(serde_json::from_value(data)?),
            "error" => Self::Error(serde_json::from_value(data)?),
            "audio" => Self::Audio(serde_json::from_value(data)?),
            "text" => Self::Text(serde_json::from_value(data)?),
            other => return Err(ProtocolError::UnknownType(other.to_owned())),
        };
        Ok(payload)
    }
}
