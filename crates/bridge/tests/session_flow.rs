//! End-to-end session test: a local WebSocket server plays the backend and
//! drives the reconciler through a full tutoring turn.

use futures_util::SinkExt;
use socratic_bridge::session::BridgeSession;
use socratic_bridge::transport::TransportConfig;
use socratic_core::reconciler::BridgeEvent;
use socratic_core::transcript::EntryKind;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

async fn next_event(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<BridgeEvent>,
) -> BridgeEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for bridge event")
        .expect("event channel closed")
}

#[tokio::test]
async fn full_turn_reconciles_transcript_and_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let mut config = TransportConfig::new(url, "student-7");
    config.reconnect_delay = Duration::from_millis(100);
    let (session, mut events) = BridgeSession::new(config);

    session.connect();
    let (stream, _) = listener.accept().await.unwrap();
    let mut server = accept_async(stream).await.unwrap();

    for frame in [
        r#"{"type": "user_transcription", "data": {"text": "why does ice float", "is_final": true}}"#,
        r#"{"type": "tool_execution_start", "data": {"tool_name": "generate_experiment", "args": {"topic": "density"}}}"#,
        r#"{"type": "tool_execution_complete", "data": {"tool_name": "generate_experiment", "success": true, "result": {"id": "exp-1"}}}"#,
        r#"{"type": "text_chunk", "data": {"text": "Ice is less", "partial": true}}"#,
        r#"{"type": "text_chunk", "data": {"full_text": "Ice is less dense than water.", "partial": false}}"#,
        r#"{"type": "turn_complete", "data": {"turn_number": 1}, "conversation_state": {"turn_count": 1}}"#,
    ] {
        server.send(Message::Text(frame.into())).await.unwrap();
    }

    match next_event(&mut events).await {
        BridgeEvent::ToolStarted { name } => {
            assert_eq!(name, "generate_experiment");
        }
        other => panic!("expected tool start, got {other:?}"),
    }
    match next_event(&mut events).await {
        BridgeEvent::ToolCompleted { name, success } => {
            assert_eq!(name, "generate_experiment");
            assert!(success);
        }
        other => panic!("expected tool completion, got {other:?}"),
    }
    match next_event(&mut events).await {
        BridgeEvent::ExperimentGenerated { .. } => {}
        other => panic!("expected experiment event, got {other:?}"),
    }
    match next_event(&mut events).await {
        BridgeEvent::TurnComplete {
            turn,
            was_interrupted,
        } => {
            assert_eq!(turn, 1);
            assert!(!was_interrupted);
        }
        other => panic!("expected turn completion, got {other:?}"),
    }

    let transcript = session.transcript();
    assert_eq!(transcript.len(), 3);
    assert!(transcript[0].is_user);
    assert_eq!(transcript[0].text, "why does ice float");
    assert_eq!(transcript[1].kind, EntryKind::ToolComplete);
    assert_eq!(transcript[1].tool_success, Some(true));
    // The partial chunk was replaced, not appended.
    assert_eq!(transcript[2].text, "Ice is less dense than water.");
    assert!(!transcript[2].is_partial);

    session.disconnect();
    assert!(session.transcript().is_empty());
}

#[tokio::test]
async fn interruption_clears_pending_audio() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let mut config = TransportConfig::new(url, "student-8");
    config.reconnect_delay = Duration::from_millis(100);
    let (session, mut events) = BridgeSession::new(config);

    session.connect();
    let (stream, _) = listener.accept().await.unwrap();
    let mut server = accept_async(stream).await.unwrap();

    // Audio arrives on the binary path, then the student barges in.
    server
        .send(Message::Binary(vec![0u8; 512].into()))
        .await
        .unwrap();
    server
        .send(Message::Text(r#"{"type": "interrupted"}"#.into()))
        .await
        .unwrap();
    server
        .send(Message::Text(
            r#"{"type": "turn_complete", "data": {"turn_number": 2}}"#.into(),
        ))
        .await
        .unwrap();

    match next_event(&mut events).await {
        BridgeEvent::TurnComplete {
            turn,
            was_interrupted,
        } => {
            assert_eq!(turn, 2);
            assert!(was_interrupted);
        }
        other => panic!("expected turn completion, got {other:?}"),
    }

    session.disconnect();
}
