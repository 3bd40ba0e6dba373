//! One live bridge session: the socket transport, the event reconciler and
//! the playback manager wired together behind a single cloneable handle.
//!
//! A background loop forwards inbound wire frames into the reconciler and
//! executes the actions it returns; callers interact only through the
//! methods here and the [`BridgeEvent`] receiver handed out by
//! [`BridgeSession::new`].

use crate::playback::{DeviceSink, PlaybackEvent, PlaybackManager};
use crate::transport::{SocketSession, TransportConfig, WireMessage};
use bytes::Bytes;
use socratic_core::protocol::ClientMessage;
use socratic_core::reconciler::{Action, BidiState, BridgeEvent, Reconciler};
use socratic_core::transcript::TranscriptEntry;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct BridgeSession {
    transport: SocketSession,
    reconciler: Arc<Mutex<Reconciler>>,
    playback: PlaybackManager,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl BridgeSession {
    /// Builds the session and spawns its background loop. Returned alongside
    /// the receiver of semantic events for the caller's UI layer.
    pub fn new(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (transport, inbound_rx) = SocketSession::new(config);
        let (playback, playback_rx) = PlaybackManager::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            transport,
            reconciler: Arc::new(Mutex::new(Reconciler::new())),
            playback,
            events_tx,
        };
        tokio::spawn(session.clone().run_loop(inbound_rx, playback_rx));
        (session, events_rx)
    }

    /// Opens (or re-opens) the socket. No-op while already connected.
    pub fn connect(&self) {
        self.transport.connect();
    }

    /// Closes the socket for good, stops playback and resets session state.
    pub fn disconnect(&self) {
        self.transport.disconnect();
        self.playback.interrupt();
        self.reconciler.lock().unwrap().reset();
        info!("bridge session disconnected");
    }

    /// Installs the speaker sink. Deferred to a user gesture on platforms
    /// with autoplay restrictions.
    pub async fn initialize_audio(&self) -> anyhow::Result<()> {
        let sink = DeviceSink::open()?;
        self.playback.initialize(Box::new(sink)).await;
        Ok(())
    }

    /// Sends one captured PCM16 frame as a binary socket message.
    pub fn send_audio_frame(&self, frame: Bytes) {
        self.transport.send_binary(frame);
    }

    /// Sends base64 PCM16 audio as a JSON message, for callers that already
    /// hold encoded audio.
    pub fn send_audio_base64(&self, data: String) {
        self.transport.send_message(&ClientMessage::audio(data));
    }

    /// Sends a typed text message from the user.
    pub fn send_text(&self, content: impl Into<String>) {
        self.transport.send_message(&ClientMessage::text(content));
    }

    pub fn bidi_state(&self) -> BidiState {
        self.reconciler.lock().unwrap().state()
    }

    /// Snapshot of the running transcript.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.reconciler.lock().unwrap().transcript().to_vec()
    }

    pub fn clear_transcript(&self) {
        self.reconciler.lock().unwrap().clear_transcript();
    }

    async fn run_loop(
        self,
        mut inbound_rx: mpsc::UnboundedReceiver<WireMessage>,
        mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        let mut state_rx = self.transport.state();
        let mut inbound_open = true;
        let mut playback_open = true;
        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let connection = *state_rx.borrow_and_update();
                    debug!(?connection, "connection state changed");
                    self.reconciler.lock().unwrap().on_connection_state(connection);
                }
                incoming = inbound_rx.recv(), if inbound_open => match incoming {
                    Some(message) => self.dispatch(message),
                    None => inbound_open = false,
                },
                event = playback_rx.recv(), if playback_open => match event {
                    Some(PlaybackEvent::Started) => {
                        self.reconciler.lock().unwrap().on_playback_started();
                    }
                    Some(PlaybackEvent::Ended) => {
                        self.reconciler.lock().unwrap().on_playback_ended();
                    }
                    None => playback_open = false,
                },
            }
            if !inbound_open && !playback_open {
                break;
            }
        }
        debug!("bridge session loop ended");
    }

    fn dispatch(&self, message: WireMessage) {
        let actions = {
            let mut reconciler = self.reconciler.lock().unwrap();
            match message {
                WireMessage::Binary(data) => reconciler.handle_binary(&data),
                WireMessage::Text(text) => reconciler.handle_text(&text),
            }
        };
        for action in actions {
            match action {
                Action::PlayAudio(pcm) => self.playback.enqueue(pcm),
                Action::InterruptPlayback => self.playback.interrupt(),
                Action::Emit(event) => {
                    if self.events_tx.send(event).is_err() {
                        warn!("bridge event receiver dropped");
                    }
                }
            }
        }
    }
}
