//! WebSocket sync client for connecting to the scene server.
//!
//! Provides:
//! - Connection lifecycle (connect, hello handshake, disconnect)
//! - Request/response calls correlated by `request_id`
//! - Live operations surfaced as [`SyncEvent`]s
//! - Gap recovery for a [`Replica`] through missing-range requests
//!
//! Responses that carry no `request_id` (welcome, subscribed, pong) are
//! matched to callers in send order; the server answers frames of one
//! connection strictly in the order it receives them.

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{Envelope, OPERATION_EVENT};
use crate::engine::SyncStats;
use crate::oplog::{FullSync, DEFAULT_MAX_MISSING_RANGE};
use crate::operation::{Operation, OperationType};
use crate::protocol::{ClientMessage, ProtocolError, RequestId, ServerMessage};
use crate::replica::Replica;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established; carries the server's head sequence.
    Connected { current_sequence: u64 },
    /// Connection lost
    Disconnected,
    /// A committed operation delivered live
    Operation(Operation),
    /// Any other broadcast envelope
    Broadcast(Envelope),
}

type Waiter = oneshot::Sender<ServerMessage>;

/// The sync client.
pub struct SyncClient {
    client_id: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    next_request: AtomicU64,
    /// Callers waiting on a response with a request id
    pending: Arc<Mutex<HashMap<RequestId, Waiter>>>,
    /// Callers waiting on a response without one, in send order
    control: Arc<Mutex<VecDeque<Waiter>>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    request_timeout: Duration,
    /// Widest `missing` span the server answers, from its welcome.
    max_missing_range: u64,
}

impl SyncClient {
    /// `client_id` is recorded on every operation this client submits.
    pub fn new(client_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            client_id: client_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            next_request: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            control: Arc::new(Mutex::new(VecDeque::new())),
            outgoing_tx: None,
            max_missing_range: DEFAULT_MAX_MISSING_RANGE,
            event_tx,
            event_rx: Some(event_rx),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, say hello and return the server's head sequence.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<u64, ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: route responses to waiters, events to the application
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let control = self.control.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(ServerMessage::Event { envelope }) => forward_event(&event_tx, envelope),
                        Ok(response) => {
                            let waiter = match response.request_id() {
                                Some(id) => pending.lock().await.remove(&id),
                                None => control.lock().await.pop_front(),
                            };
                            match waiter {
                                Some(waiter) => {
                                    let _ = waiter.send(response);
                                }
                                None => log::debug!("Unsolicited response: {response:?}"),
                            }
                        }
                        Err(e) => log::warn!("Failed to decode server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail every outstanding request
            *state.write().await = ConnectionState::Disconnected;
            pending.lock().await.clear();
            control.lock().await.clear();
            let _ = event_tx.try_send(SyncEvent::Disconnected);
        });

        let reply = self
            .control_request(ClientMessage::Hello {
                client_id: self.client_id.clone(),
            })
            .await;
        match reply {
            Ok(ServerMessage::Welcome { current_sequence, max_missing_range, .. }) => {
                self.max_missing_range = max_missing_range.max(1);
                *self.state.write().await = ConnectionState::Connected;
                let _ = self.event_tx.try_send(SyncEvent::Connected { current_sequence });
                log::info!("Connected to {} as {}", self.server_url, self.client_id);
                Ok(current_sequence)
            }
            Ok(other) => {
                self.disconnect().await;
                Err(unexpected(other))
            }
            Err(e) => {
                self.disconnect().await;
                Err(e)
            }
        }
    }

    /// Close the connection. Outstanding requests fail with `ConnectionClosed`.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::NotConnected)?;
        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn await_reply(&self, rx: oneshot::Receiver<ServerMessage>) -> Result<ServerMessage, ProtocolError> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(ServerMessage::Rejected { kind, message, retryable, .. })) => Err(ProtocolError::Rejected {
                kind,
                message,
                retryable,
            }),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    /// Send a request carrying a fresh `request_id` and await its response.
    async fn request(
        &self,
        build: impl FnOnce(RequestId) -> ClientMessage,
    ) -> Result<ServerMessage, ProtocolError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if let Err(e) = self.send(&build(id)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        let reply = self.await_reply(rx).await;
        if matches!(reply, Err(ProtocolError::Timeout)) {
            self.pending.lock().await.remove(&id);
        }
        reply
    }

    /// Send a request whose response has no `request_id`.
    async fn control_request(&self, msg: ClientMessage) -> Result<ServerMessage, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        {
            // Queue order must equal send order.
            let mut control = self.control.lock().await;
            self.send(&msg).await?;
            control.push_back(tx);
        }
        self.await_reply(rx).await
    }

    // ─── Operations ────────────────────────────────────────────────

    /// Submit an operation; returns its sequence number.
    pub async fn submit(&self, op_type: OperationType, data: Map<String, Value>) -> Result<u64, ProtocolError> {
        self.submit_raw(op_type.as_str(), data).await
    }

    /// Submit with an arbitrary type tag, as a front end relaying input would.
    pub async fn submit_raw(&self, op_type: &str, data: Map<String, Value>) -> Result<u64, ProtocolError> {
        let reply = self
            .request(|request_id| ClientMessage::Submit {
                request_id,
                op_type: op_type.to_string(),
                data,
            })
            .await?;
        match reply {
            ServerMessage::Submitted { sequence, .. } => Ok(sequence),
            other => Err(unexpected(other)),
        }
    }

    pub async fn full_sync(&self) -> Result<FullSync, ProtocolError> {
        match self.request(|request_id| ClientMessage::FullSync { request_id }).await? {
            ServerMessage::FullSync {
                operations,
                current_sequence,
                ..
            } => Ok(FullSync {
                operations,
                current_sequence,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn missing(&self, from: u64, to: u64) -> Result<Vec<Operation>, ProtocolError> {
        match self
            .request(|request_id| ClientMessage::Missing { request_id, from, to })
            .await?
        {
            ServerMessage::Operations { operations, .. } => Ok(operations),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stats(&self) -> Result<SyncStats, ProtocolError> {
        match self.request(|request_id| ClientMessage::Stats { request_id }).await? {
            ServerMessage::Stats { stats, .. } => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    /// Start receiving a session's operations. Returns the head sequence at
    /// the moment the subscription took effect.
    pub async fn subscribe(&self, session_id: Uuid) -> Result<u64, ProtocolError> {
        match self.control_request(ClientMessage::Subscribe { session_id }).await? {
            ServerMessage::Subscribed { current_sequence, .. } => Ok(current_sequence),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unsubscribe(&self, session_id: Uuid) -> Result<(), ProtocolError> {
        match self.control_request(ClientMessage::Unsubscribe { session_id }).await? {
            ServerMessage::Unsubscribed { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        match self.control_request(ClientMessage::Ping).await? {
            ServerMessage::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch and apply everything `replica` lacks up to `head`, including
    /// any gap in front of buffered live operations. Pages are no wider
    /// than the server's announced range cap. Returns how many operations
    /// were fetched.
    pub async fn catch_up(&self, replica: &mut Replica, head: u64) -> Result<usize, ProtocolError> {
        let mut fetched = 0;
        loop {
            let (from, to) = match replica.missing_range() {
                Some(gap) => gap,
                None if replica.last_applied() < head => (replica.last_applied() + 1, head),
                None => break,
            };
            let to = to.min(from.saturating_add(self.max_missing_range - 1));
            let operations = self.missing(from, to).await?;
            if operations.is_empty() {
                break;
            }
            fetched += operations.len();
            replica
                .ingest_all(operations)
                .await
                .map_err(|e| ProtocolError::UnexpectedResponse(format!("replica diverged: {e}")))?;
        }
        Ok(fetched)
    }

    // ─── Accessors ─────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The server's `missing` span limit, as announced on connect.
    pub fn max_missing_range(&self) -> u64 {
        self.max_missing_range
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn forward_event(event_tx: &mpsc::Sender<SyncEvent>, envelope: Envelope) {
    let event = if envelope.kind == OPERATION_EVENT {
        match serde_json::from_value::<Operation>(envelope.payload.clone()) {
            Ok(op) => SyncEvent::Operation(op),
            Err(e) => {
                log::warn!("Malformed operation event: {e}");
                SyncEvent::Broadcast(envelope)
            }
        }
    } else {
        SyncEvent::Broadcast(envelope)
    };
    if event_tx.try_send(event).is_err() {
        log::warn!("Event queue full, dropping live event");
    }
}

fn unexpected(reply: ServerMessage) -> ProtocolError {
    ProtocolError::UnexpectedResponse(format!("{reply:?}"))
}
