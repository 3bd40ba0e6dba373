//! Socket session: owns the persistent duplex connection to the agent
//! backend, including lifecycle and the automatic reconnection policy.
//!
//! One physical connection exists per logical session. Sends are best-effort
//! while disconnected (logged, never thrown); inbound frames are forwarded
//! untouched to the reconciler. Reconnection uses an unconditional fixed
//! delay and is suppressed only by an explicit [`SocketSession::disconnect`].

use crate::config::RECONNECT_DELAY;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use socratic_core::protocol::ClientMessage;
use socratic_core::reconciler::ConnectionState;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One raw frame received from the backend.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Binary(Bytes),
    Text(String),
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub base_url: String,
    pub user_id: String,
    pub reconnect_delay: Duration,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            user_id: user_id.into(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

/// Handle to the socket session; cheap to clone, all clones share state.
#[derive(Clone)]
pub struct SocketSession {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::UnboundedSender<WireMessage>,
    conn: Mutex<Conn>,
}

#[derive(Default)]
struct Conn {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    session_id: Option<Uuid>,
    /// Set by `disconnect()`; the only thing that suppresses reconnection.
    shutdown: bool,
    /// Incremented per `connect()` so stale connection tasks cannot clobber
    /// the state of their successor.
    epoch: u64,
    reconnect: Option<JoinHandle<()>>,
}

impl SocketSession {
    pub fn new(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<WireMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let session = Self {
            inner: Arc::new(Inner {
                config,
                state_tx,
                inbound_tx,
                conn: Mutex::new(Conn::default()),
            }),
        };
        (session, inbound_rx)
    }

    /// Subscribes to connection-state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Session id of the current (or most recent) physical connection.
    pub fn session_id(&self) -> Option<Uuid> {
        self.inner.conn.lock().unwrap().session_id
    }

    /// Opens the socket. A no-op while already connecting or connected.
    /// Each attempt uses a fresh session id to avoid backend session
    /// collisions on reconnect.
    pub fn connect(&self) {
        let mut conn = self.inner.conn.lock().unwrap();
        if matches!(
            *self.inner.state_tx.borrow(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!("connect() ignored; socket already open");
            return;
        }
        conn.shutdown = false;
        if let Some(handle) = conn.reconnect.take() {
            handle.abort();
        }
        conn.epoch += 1;
        let epoch = conn.epoch;
        let session_id = Uuid::new_v4();
        conn.session_id = Some(session_id);
        drop(conn);

        let _ = self.inner.state_tx.send(ConnectionState::Connecting);
        let session = self.clone();
        tokio::spawn(async move {
            session.run_connection(session_id, epoch).await;
        });
    }

    /// Sends an explicit close intent if the channel is open, closes the
    /// socket, cancels any pending auto-reconnect, and settles on `Idle`.
    pub fn disconnect(&self) {
        let mut conn = self.inner.conn.lock().unwrap();
        conn.shutdown = true;
        if let Some(handle) = conn.reconnect.take() {
            handle.abort();
        }
        if let Some(tx) = conn.outbound.take() {
            if let Ok(payload) = serde_json::to_string(&ClientMessage::Close) {
                let _ = tx.send(Message::Text(payload.into()));
            }
            let _ = tx.send(Message::Close(None));
        }
        drop(conn);
        let _ = self.inner.state_tx.send(ConnectionState::Idle);
    }

    /// Binary audio frame, best-effort.
    pub fn send_binary(&self, data: Bytes) {
        self.send_raw(Message::Binary(data));
    }

    /// JSON control/text frame, best-effort.
    pub fn send_message(&self, message: &ClientMessage) {
        match serde_json::to_string(message) {
            Ok(payload) => self.send_raw(Message::Text(payload.into())),
            Err(err) => error!(%err, "failed to serialize client message"),
        }
    }

    fn send_raw(&self, message: Message) {
        let conn = self.inner.conn.lock().unwrap();
        if *self.inner.state_tx.borrow() != ConnectionState::Connected {
            debug!("dropping send while socket is not open");
            return;
        }
        match &conn.outbound {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!("dropping send; connection task already gone");
                }
            }
            None => debug!("dropping send; no active connection"),
        }
    }

    async fn run_connection(self, session_id: Uuid, epoch: u64) {
        let url = format!(
            "{}/{}/{}",
            self.inner.config.base_url.trim_end_matches('/'),
            self.inner.config.user_id,
            session_id
        );
        let (stream, _) = match connect_async(&url).await {
            Ok(ok) => ok,
            Err(err) => {
                error!(%err, %url, "websocket connect failed");
                self.finish(epoch, ConnectionState::Error);
                return;
            }
        };
        info!(%url, "websocket connected");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        {
            let mut conn = self.inner.conn.lock().unwrap();
            if conn.epoch != epoch || conn.shutdown {
                debug!("connection superseded while dialing");
                return;
            }
            conn.outbound = Some(outbound_tx);
        }
        let _ = self.inner.state_tx.send(ConnectionState::Connected);

        let (mut sink, mut source) = stream.split();
        let mut next_state = ConnectionState::Error;
        loop {
            tokio::select! {
                outgoing = outbound_rx.recv() => match outgoing {
                    Some(message) => {
                        let closing = matches!(message, Message::Close(_));
                        if let Err(err) = sink.send(message).await {
                            warn!(%err, "websocket send failed");
                            break;
                        }
                        if closing {
                            next_state = ConnectionState::Idle;
                            break;
                        }
                    }
                    None => {
                        next_state = ConnectionState::Idle;
                        break;
                    }
                },
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = self.inner.inbound_tx.send(WireMessage::Binary(data));
                    }
                    Some(Ok(Message::Text(text))) => {
                        let _ = self.inner.inbound_tx.send(WireMessage::Text(text.to_string()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let normal = frame
                            .as_ref()
                            .map(|f| matches!(f.code, CloseCode::Normal | CloseCode::Away))
                            .unwrap_or(false);
                        info!(?frame, "websocket closed by peer");
                        next_state = if normal {
                            ConnectionState::Idle
                        } else {
                            ConnectionState::Error
                        };
                        break;
                    }
                    // Ping/pong is handled by the protocol layer.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "websocket read error");
                        break;
                    }
                    None => break,
                },
            }
        }
        self.finish(epoch, next_state);
    }

    fn finish(&self, epoch: u64, state: ConnectionState) {
        let mut conn = self.inner.conn.lock().unwrap();
        if conn.epoch != epoch {
            return;
        }
        conn.outbound = None;
        let shutdown = conn.shutdown;
        if !shutdown {
            // Fixed-delay, uncapped reconnection.
            let session = self.clone();
            let delay = self.inner.config.reconnect_delay;
            conn.reconnect = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                session.connect();
            }));
        }
        drop(conn);
        let state = if shutdown { ConnectionState::Idle } else { state };
        let _ = self.inner.state_tx.send(state);
        if !shutdown {
            info!(?state, "connection ended; reconnect scheduled");
        }
    }
}
