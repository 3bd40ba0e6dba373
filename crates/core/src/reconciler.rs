//! The bridge core: classifies every inbound wire message, drives the
//! conversation/turn/tool state machines, and emits typed actions for the
//! IO layer to apply (audio to play, playback to interrupt, events to
//! surface to the UI).

use crate::pcm;
use crate::protocol::{
    self, ConversationSnapshot, EventPayload, InboundMessage, NativeEvent, ProtocolError,
    ServerEvent, ToolComplete, tools,
};
use crate::transcript::{EntryKind, Transcript, TranscriptEntry};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Connection state, owned by the transport. Declared here so the reconciler
/// can derive [`BidiState`] from it without depending on the IO layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
}

/// The UI-facing channel state, derived from the connection state plus
/// playback activity. `Speaking` holds while audio is in flight and reverts
/// to `Connected` when playback ends or the turn is completed/interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BidiState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Speaking,
    Error,
}

/// Explicit per-turn phase. Thinking is entered via the native thought flag
/// and cleared by tool starts, interruption and turn completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    Thinking,
    ToolRunning,
    Speaking,
}

/// Conversation fields mirrored from backend envelopes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    pub current_agent: Option<String>,
    pub turn_count: u32,
    pub is_processing_tool: bool,
}

/// Typed domain events surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    ToolStarted { name: String },
    ToolCompleted { name: String, success: bool },
    ExperimentGenerated { experiment: Value },
    ExperimentModified { experiment: Value },
    ComparisonCreated { comparison: Value },
    ConceptExplained { concept: Value },
    CanvasReset,
    AgentTransition { from: String, to: String },
    TurnComplete { turn: u32, was_interrupted: bool },
    BackendError { code: String, message: String },
}

/// Side effects requested by the reconciler, applied by the caller in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Raw PCM16 bytes at the playback rate, to be enqueued for playback.
    PlayAudio(Vec<u8>),
    /// Drop all queued audio and stop the active output immediately.
    InterruptPlayback,
    Emit(BridgeEvent),
}

#[derive(Debug, Default)]
pub struct Reconciler {
    transcript: Transcript,
    conversation: ConversationState,
    phase: TurnPhase,
    state: BidiState,
    turn_interrupted: bool,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BidiState {
        self.state
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    /// Read-only snapshot of the transcript; mutation happens only through
    /// inbound message handling and [`Self::clear_transcript`].
    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.transcript.entries()
    }

    pub fn clear_transcript(&mut self) {
        self.transcript.clear();
    }

    /// Full reset, used on disconnect+reconnect.
    pub fn reset(&mut self) {
        self.transcript.clear();
        self.conversation = ConversationState::default();
        self.phase = TurnPhase::Idle;
        self.turn_interrupted = false;
        if self.state == BidiState::Speaking {
            self.state = BidiState::Connected;
        }
    }

    /// Mirrors a transport state transition into the derived BIDI state.
    pub fn on_connection_state(&mut self, connection: ConnectionState) {
        self.state = match connection {
            ConnectionState::Idle => BidiState::Idle,
            ConnectionState::Connecting => BidiState::Connecting,
            ConnectionState::Connected => BidiState::Connected,
            ConnectionState::Error => BidiState::Error,
        };
        if !matches!(connection, ConnectionState::Connected) {
            self.phase = TurnPhase::Idle;
        }
    }

    pub fn on_playback_started(&mut self) {
        if self.state == BidiState::Connected {
            self.state = BidiState::Speaking;
        }
        if matches!(self.phase, TurnPhase::Idle | TurnPhase::Thinking) {
            self.phase = TurnPhase::Speaking;
        }
    }

    pub fn on_playback_ended(&mut self) {
        if self.state == BidiState::Speaking {
            self.state = BidiState::Connected;
        }
        if self.phase == TurnPhase::Speaking {
            self.phase = TurnPhase::Idle;
        }
    }

    /// Binary frames are raw playback audio.
    pub fn handle_binary(&mut self, data: &[u8]) -> Vec<Action> {
        vec![Action::PlayAudio(data.to_vec())]
    }

    /// Classifies and applies one inbound text frame. Malformed messages and
    /// unrecognized event types are logged and dropped; processing continues
    /// with the next message.
    pub fn handle_text(&mut self, raw: &str) -> Vec<Action> {
        match protocol::parse_inbound(raw) {
            Ok(InboundMessage::Event(event)) => self.apply_event(event),
            Ok(InboundMessage::Native(native)) => self.apply_native(native),
            Err(ProtocolError::UnknownType(kind)) => {
                debug!(%kind, "ignoring unrecognized event type");
                Vec::new()
            }
            Err(err) => {
                warn!(%err, payload = raw, "dropping malformed inbound message");
                Vec::new()
            }
        }
    }

    fn apply_event(&mut self, event: ServerEvent) -> Vec<Action> {
        if let Some(snapshot) = &event.conversation_state {
            self.apply_snapshot(snapshot);
        }
        let ts = event.timestamp.unwrap_or_else(now_epoch_secs);
        let mut actions = Vec::new();
        match event.payload {
            EventPayload::ToolExecutionStart(start) => {
                self.phase = TurnPhase::ToolRunning;
                self.transcript
                    .push_tool_start(TranscriptEntry::tool_start(start.tool_name.clone(), ts));
                actions.push(Action::Emit(BridgeEvent::ToolStarted {
                    name: start.tool_name,
                }));
            }
            EventPayload::ToolExecutionComplete(done) => {
                self.transcript.complete_tool(&done.tool_name, done.success, ts);
                self.transcript.finalize_trailing_partials(false);
                if self.phase == TurnPhase::ToolRunning {
                    self.phase = TurnPhase::Idle;
                }
                actions.push(Action::Emit(BridgeEvent::ToolCompleted {
                    name: done.tool_name.clone(),
                    success: done.success,
                }));
                if let Some(event) = semantic_tool_event(&done) {
                    actions.push(Action::Emit(event));
                }
            }
            EventPayload::TextChunk(chunk) => {
                let is_partial = chunk.partial.unwrap_or(false);
                let text = chunk.full_text.unwrap_or(chunk.text);
                let entry = if self.phase == TurnPhase::Thinking {
                    TranscriptEntry::thinking(text, is_partial, ts)
                } else {
                    TranscriptEntry::message(text, false, is_partial, ts)
                };
                self.transcript.upsert(entry);
            }
            EventPayload::AgentActive(active) => {
                info!(agent = %active.agent, "agent active");
            }
            EventPayload::AgentTransition(transition) => {
                actions.push(Action::Emit(BridgeEvent::AgentTransition {
                    from: transition.from,
                    to: transition.to,
                }));
            }
            EventPayload::Interrupted => {
                actions.push(Action::InterruptPlayback);
                self.turn_interrupted = true;
                self.phase = TurnPhase::Idle;
                if self.state == BidiState::Speaking {
                    self.state = BidiState::Connected;
                }
            }
            EventPayload::TurnComplete(turn) => {
                self.phase = TurnPhase::Idle;
                if self.state == BidiState::Speaking {
                    self.state = BidiState::Connected;
                }
                self.transcript.finalize_trailing_partials(false);
                let was_interrupted = turn.interrupted.unwrap_or(self.turn_interrupted);
                self.turn_interrupted = false;
                actions.push(Action::Emit(BridgeEvent::TurnComplete {
                    turn: turn.turn_number.unwrap_or(self.conversation.turn_count),
                    was_interrupted,
                }));
            }
            EventPayload::UserTranscription(t) => {
                let is_partial = !t.is_final.unwrap_or(true);
                self.transcript
                    .upsert(TranscriptEntry::message(t.text, true, is_partial, ts));
            }
            EventPayload::ModelTranscription(t) => {
                let is_partial = !t.is_final.unwrap_or(true);
                self.transcript
                    .upsert(TranscriptEntry::message(t.text, false, is_partial, ts));
            }
            EventPayload::Error(err) => {
                self.state = BidiState::Error;
                actions.push(Action::Emit(BridgeEvent::BackendError {
                    code: err.code.unwrap_or_else(|| "unknown".to_owned()),
                    message: err.message,
                }));
            }
            EventPayload::Audio(chunk) => match pcm::decode_base64(&chunk.data) {
                Ok(bytes) => actions.push(Action::PlayAudio(bytes)),
                Err(err) => warn!(%err, "dropping undecodable audio payload"),
            },
            EventPayload::Text(legacy) => {
                self.transcript
                    .upsert(TranscriptEntry::message(legacy.content, false, false, ts));
            }
        }
        actions
    }

    /// The legacy native shape is special-cased: function parts are logged
    /// only, a thought flag moves the turn into the thinking phase, inline
    /// audio is decoded and played, and plain text / output transcriptions
    /// are ignored because the same content arrives via the structured
    /// envelope.
    fn apply_native(&mut self, native: NativeEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(content) = native.content else {
            return actions;
        };
        for part in content.parts {
            if part.function_call.is_some() || part.function_response.is_some() {
                debug!(author = ?native.author, "native function part; structured envelope carries the event");
                continue;
            }
            if part.thought == Some(true) {
                self.phase = TurnPhase::Thinking;
            }
            if let Some(blob) = part.inline_data {
                match pcm::decode_base64(&blob.data) {
                    Ok(bytes) => actions.push(Action::PlayAudio(bytes)),
                    Err(err) => warn!(
                        original = err.original_len,
                        cleaned = err.cleaned_len,
                        "dropping undecodable inline audio"
                    ),
                }
            }
        }
        actions
    }

    fn apply_snapshot(&mut self, snapshot: &ConversationSnapshot) {
        if let Some(agent) = &snapshot.current_agent {
            self.conversation.current_agent = Some(agent.clone());
        }
        if let Some(count) = snapshot.turn_count {
            self.conversation.turn_count = count;
        }
        if let Some(flag) = snapshot.is_processing_tool {
            self.conversation.is_processing_tool = flag;
        }
    }
}

fn semantic_tool_event(done: &ToolComplete) -> Option<BridgeEvent> {
    if !done.success {
        return None;
    }
    let result = done.result.clone();
    match done.tool_name.as_str() {
        tools::GENERATE_EXPERIMENT => {
            result.map(|experiment| BridgeEvent::ExperimentGenerated { experiment })
        }
        tools::MODIFY_EXPERIMENT => {
            result.map(|experiment| BridgeEvent::ExperimentModified { experiment })
        }
        tools::CREATE_COMPARISON => {
            result.map(|comparison| BridgeEvent::ComparisonCreated { comparison })
        }
        tools::EXPLAIN_CONCEPT => result.map(|concept| BridgeEvent::ConceptExplained { concept }),
        tools::RESET_CANVAS => Some(BridgeEvent::CanvasReset),
        _ => None,
    }
}

fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::encode_base64;
    use serde_json::json;

    fn env(kind: &str, data: Value) -> String {
        json!({"type": kind, "timestamp": 1.0, "data": data}).to_string()
    }

    fn chunk(r: &mut Reconciler, text: &str, partial: bool) -> Vec<Action> {
        r.handle_text(&env("text_chunk", json!({"text": text, "partial": partial})))
    }

    #[test]
    fn partial_run_coalesces_to_single_final_entry() {
        let mut r = Reconciler::new();
        chunk(&mut r, "New", true);
        chunk(&mut r, "Newton's", true);
        chunk(&mut r, "Newton's second law", false);
        assert_eq!(r.transcript().len(), 1);
        assert_eq!(r.transcript()[0].text, "Newton's second law");
        assert!(!r.transcript()[0].is_partial);
    }

    #[test]
    fn text_chunk_prefers_accumulated_full_text() {
        let mut r = Reconciler::new();
        r.handle_text(&env(
            "text_chunk",
            json!({"text": "law", "full_text": "Newton's law", "partial": true}),
        ));
        assert_eq!(r.transcript()[0].text, "Newton's law");
    }

    #[test]
    fn thinking_upgrade_replaces_partial_message_in_place() {
        let mut r = Reconciler::new();
        chunk(&mut r, "Let me", true);
        // The thought flag arrives mid-stream via the native shape.
        r.handle_text(&json!({"content": {"parts": [{"thought": true}]}}).to_string());
        chunk(&mut r, "Let me reason about this", true);
        assert_eq!(r.transcript().len(), 1);
        assert_eq!(r.transcript()[0].kind, EntryKind::Thinking);
        assert_eq!(r.phase(), TurnPhase::Thinking);
    }

    #[test]
    fn tool_pairing_flips_original_entry_across_interleaved_messages() {
        let mut r = Reconciler::new();
        r.handle_text(&env("tool_execution_start", json!({"tool_name": "simulate"})));
        chunk(&mut r, "setting up the experiment", true);
        let actions = r.handle_text(&env(
            "tool_execution_complete",
            json!({"tool_name": "simulate", "success": true}),
        ));
        assert_eq!(r.transcript().len(), 2);
        assert_eq!(r.transcript()[0].kind, EntryKind::ToolComplete);
        assert_eq!(r.transcript()[0].tool_success, Some(true));
        // The interleaved partial is finalized so the next turn starts fresh.
        assert!(!r.transcript()[1].is_partial);
        assert!(actions.contains(&Action::Emit(BridgeEvent::ToolCompleted {
            name: "simulate".into(),
            success: true,
        })));
    }

    #[test]
    fn unmatched_tool_complete_appends_standalone_entry() {
        let mut r = Reconciler::new();
        r.handle_text(&env(
            "tool_execution_complete",
            json!({"tool_name": "simulate", "success": false}),
        ));
        assert_eq!(r.transcript().len(), 1);
        assert_eq!(r.transcript()[0].kind, EntryKind::ToolComplete);
        assert_eq!(r.transcript()[0].tool_success, Some(false));
    }

    #[test]
    fn tool_start_clears_thinking_phase() {
        let mut r = Reconciler::new();
        r.handle_text(&json!({"content": {"parts": [{"thought": true}]}}).to_string());
        assert_eq!(r.phase(), TurnPhase::Thinking);
        r.handle_text(&env("tool_execution_start", json!({"tool_name": "simulate"})));
        assert_eq!(r.phase(), TurnPhase::ToolRunning);
    }

    #[test]
    fn recognized_tools_emit_semantic_events() {
        let mut r = Reconciler::new();
        let actions = r.handle_text(&env(
            "tool_execution_complete",
            json!({"tool_name": "generate_experiment", "success": true, "result": {"id": 7}}),
        ));
        assert!(actions.contains(&Action::Emit(BridgeEvent::ExperimentGenerated {
            experiment: json!({"id": 7}),
        })));

        let actions = r.handle_text(&env(
            "tool_execution_complete",
            json!({"tool_name": "reset_canvas", "success": true}),
        ));
        assert!(actions.contains(&Action::Emit(BridgeEvent::CanvasReset)));

        // A failed tool never emits its semantic event.
        let actions = r.handle_text(&env(
            "tool_execution_complete",
            json!({"tool_name": "generate_experiment", "success": false, "result": {}}),
        ));
        assert_eq!(
            actions
                .iter()
                .filter(|a| matches!(a, Action::Emit(BridgeEvent::ExperimentGenerated { .. })))
                .count(),
            0
        );
    }

    #[test]
    fn malformed_message_is_dropped_and_next_one_processed() {
        let mut r = Reconciler::new();
        assert!(r.handle_text("{{{ not json").is_empty());
        let actions = r.handle_text(&env("turn_complete", json!({"turn_number": 2})));
        assert!(actions.contains(&Action::Emit(BridgeEvent::TurnComplete {
            turn: 2,
            was_interrupted: false,
        })));
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        let mut r = Reconciler::new();
        assert!(r.handle_text(&env("telemetry", json!({}))).is_empty());
        assert!(r.transcript().is_empty());
    }

    #[test]
    fn interrupted_drops_playback_and_reverts_to_connected() {
        let mut r = Reconciler::new();
        r.on_connection_state(ConnectionState::Connected);
        r.on_playback_started();
        assert_eq!(r.state(), BidiState::Speaking);
        let actions = r.handle_text(&env("interrupted", json!({})));
        assert!(actions.contains(&Action::InterruptPlayback));
        assert_eq!(r.state(), BidiState::Connected);
        // The interruption is remembered until the turn completes.
        let actions = r.handle_text(&env("turn_complete", json!({})));
        assert!(actions.contains(&Action::Emit(BridgeEvent::TurnComplete {
            turn: 0,
            was_interrupted: true,
        })));
    }

    #[test]
    fn turn_complete_reverts_speaking_and_clears_thinking() {
        let mut r = Reconciler::new();
        r.on_connection_state(ConnectionState::Connected);
        r.handle_text(&json!({"content": {"parts": [{"thought": true}]}}).to_string());
        r.on_playback_started();
        r.handle_text(&env("turn_complete", json!({"turn_number": 1})));
        assert_eq!(r.state(), BidiState::Connected);
        assert_eq!(r.phase(), TurnPhase::Idle);
    }

    #[test]
    fn playback_lifecycle_toggles_speaking() {
        let mut r = Reconciler::new();
        r.on_connection_state(ConnectionState::Connected);
        r.on_playback_started();
        assert_eq!(r.state(), BidiState::Speaking);
        r.on_playback_ended();
        assert_eq!(r.state(), BidiState::Connected);
    }

    #[test]
    fn conversation_snapshot_applied_verbatim_and_sticky() {
        let mut r = Reconciler::new();
        let raw = json!({
            "type": "text_chunk",
            "conversation_state": {"current_agent": "chemistry", "turn_count": 4, "is_processing_tool": true},
            "data": {"text": "x"}
        })
        .to_string();
        r.handle_text(&raw);
        assert_eq!(r.conversation().current_agent.as_deref(), Some("chemistry"));
        assert_eq!(r.conversation().turn_count, 4);
        assert!(r.conversation().is_processing_tool);
        // An envelope without the snapshot leaves the state unchanged.
        r.handle_text(&env("text_chunk", json!({"text": "y"})));
        assert_eq!(r.conversation().turn_count, 4);
    }

    #[test]
    fn user_transcription_respects_is_final() {
        let mut r = Reconciler::new();
        r.handle_text(&env("user_transcription", json!({"text": "why", "is_final": false})));
        assert!(r.transcript()[0].is_partial);
        assert!(r.transcript()[0].is_user);
        r.handle_text(&env(
            "user_transcription",
            json!({"text": "why is the sky blue", "is_final": true}),
        ));
        assert_eq!(r.transcript().len(), 1);
        assert!(!r.transcript()[0].is_partial);
    }

    #[test]
    fn model_transcription_appends_as_agent_message() {
        let mut r = Reconciler::new();
        r.handle_text(&env("model_transcription", json!({"text": "because", "is_final": true})));
        assert_eq!(r.transcript().len(), 1);
        assert!(!r.transcript()[0].is_user);
    }

    #[test]
    fn backend_error_surfaces_and_sets_error_state() {
        let mut r = Reconciler::new();
        r.on_connection_state(ConnectionState::Connected);
        let actions = r.handle_text(&env(
            "error",
            json!({"code": "quota", "message": "rate limited"}),
        ));
        assert!(actions.contains(&Action::Emit(BridgeEvent::BackendError {
            code: "quota".into(),
            message: "rate limited".into(),
        })));
        assert_eq!(r.state(), BidiState::Error);
    }

    #[test]
    fn binary_frames_become_play_actions() {
        let mut r = Reconciler::new();
        let actions = r.handle_binary(&[1, 2, 3, 4]);
        assert_eq!(actions, vec![Action::PlayAudio(vec![1, 2, 3, 4])]);
    }

    #[test]
    fn legacy_audio_envelope_is_decoded_and_played() {
        let mut r = Reconciler::new();
        let payload = encode_base64(&[0, 64, 0, 192]);
        let actions = r.handle_text(&env("audio", json!({"data": payload})));
        assert_eq!(actions, vec![Action::PlayAudio(vec![0, 64, 0, 192])]);

        // An undecodable payload is dropped, not propagated.
        assert!(r.handle_text(&env("audio", json!({"data": "!!!"}))).is_empty());
    }

    #[test]
    fn native_inline_audio_is_played_but_text_is_ignored() {
        let mut r = Reconciler::new();
        let payload = encode_base64(&[1, 2]);
        let raw = json!({
            "content": {"parts": [
                {"text": "duplicate of the structured path"},
                {"inlineData": {"data": payload}}
            ]},
            "outputTranscription": {"text": "also ignored"}
        })
        .to_string();
        let actions = r.handle_text(&raw);
        assert_eq!(actions, vec![Action::PlayAudio(vec![1, 2])]);
        assert!(r.transcript().is_empty());
    }

    #[test]
    fn native_function_parts_are_logged_only() {
        let mut r = Reconciler::new();
        let raw = json!({
            "content": {"parts": [{"functionCall": {"name": "simulate"}}]}
        })
        .to_string();
        assert!(r.handle_text(&raw).is_empty());
        assert!(r.transcript().is_empty());
    }

    #[test]
    fn clear_and_reset_lifecycles() {
        let mut r = Reconciler::new();
        chunk(&mut r, "hello", false);
        r.clear_transcript();
        assert!(r.transcript().is_empty());

        r.on_connection_state(ConnectionState::Connected);
        chunk(&mut r, "again", false);
        r.reset();
        assert!(r.transcript().is_empty());
        assert_eq!(r.conversation(), &ConversationState::default());
    }
}
