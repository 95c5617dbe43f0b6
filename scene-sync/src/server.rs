//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                   ┌── SceneStore (sessions)
//!             ├── connection ────┤
//! Client B ──┘     task          ├── OperationLog (sequence)
//!                    ▲           └── BroadcastHub
//!                    │                    │
//!                    └── outbound queue ◄─┘  (one bounded queue per client)
//! ```
//!
//! Each connection task owns its socket and `select!`s over inbound frames,
//! its hub queue and a heartbeat timer. Requests are answered directly from
//! the engine; live operations arrive through the hub queue as `event`
//! frames.

use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::ClientId;
use crate::engine::{EngineConfig, OperationRequest, SceneEngine};
use crate::error::{ErrorKind, SyncError};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections beyond this are refused with a retryable rejection
    pub max_clients: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_clients: 1024,
            heartbeat_interval_secs: 30,
            engine: EngineConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub frames_received: u64,
    pub rejected_frames: u64,
    pub total_bytes: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SceneEngine>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server with a fresh engine. Must run inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let engine = SceneEngine::start(config.engine.clone());
        Self::with_engine(config, engine)
    }

    /// Serve an existing engine.
    pub fn with_engine(config: ServerConfig, engine: Arc<SceneEngine>) -> Self {
        Self {
            config,
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SceneEngine>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            if s.active_connections as usize >= config.max_clients {
                s.refused_connections += 1;
                drop(s);
                log::warn!("Refusing {addr}: {} clients connected", config.max_clients);
                let refusal = ServerMessage::Rejected {
                    request_id: None,
                    kind: ErrorKind::Transient,
                    message: "server is at capacity".to_string(),
                    retryable: true,
                };
                send(&mut ws_sender, &refusal).await?;
                ws_sender.send(Message::Close(None)).await?;
                return Ok(());
            }
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (hub_id, mut outbound) = engine.hub().connect(addr.to_string()).await;
        let mut client_id = hub_id.to_string();
        log::info!("WebSocket connection established from {addr} as {hub_id}");

        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.frames_received += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                let reply = match ClientMessage::decode(text.as_str()) {
                                    Ok(request) => respond(&engine, hub_id, &mut client_id, request).await,
                                    Err(e) => {
                                        stats.write().await.rejected_frames += 1;
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        ServerMessage::rejected(None, &SyncError::Validation(e.to_string()))
                                    }
                                };
                                send(&mut ws_sender, &reply).await?;
                            }

                            Some(Ok(Message::Binary(_))) => {
                                stats.write().await.rejected_frames += 1;
                                let error = SyncError::Validation("binary frames are not supported".into());
                                send(&mut ws_sender, &ServerMessage::rejected(None, &error)).await?;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    envelope = outbound.recv() => {
                        match envelope {
                            Some(envelope) => {
                                let event = ServerMessage::Event { envelope: (*envelope).clone() };
                                send(&mut ws_sender, &event).await?;
                            }
                            // The hub dropped us.
                            None => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok::<(), ProtocolError>(())
        }
        .await;

        // Pending envelopes are discarded with the queue.
        engine.hub().disconnect(&hub_id).await;
        stats.write().await.active_connections -= 1;
        log::debug!("Client {hub_id} ({client_id}) unregistered");

        result.map_err(Into::into)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<SceneEngine> {
        &self.engine
    }
}

async fn send<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), ProtocolError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = msg.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Answer one client request.
async fn respond(
    engine: &SceneEngine,
    hub_id: ClientId,
    client_id: &mut String,
    request: ClientMessage,
) -> ServerMessage {
    match request {
        ClientMessage::Hello { client_id: announced } => {
            log::info!("Client {hub_id} identifies as {announced}");
            *client_id = announced;
            ServerMessage::Welcome {
                client_id: client_id.clone(),
                current_sequence: engine.current_sequence(),
                max_missing_range: engine.config().max_missing_range,
            }
        }

        ClientMessage::Subscribe { session_id } => match engine.get_session(session_id).await {
            Ok(Some(_)) => {
                engine.hub().subscribe(&hub_id, session_id).await;
                ServerMessage::Subscribed {
                    session_id,
                    current_sequence: engine.current_sequence(),
                }
            }
            Ok(None) => ServerMessage::rejected(None, &SyncError::SessionNotFound(session_id)),
            Err(e) => ServerMessage::rejected(None, &e),
        },

        ClientMessage::Unsubscribe { session_id } => {
            engine.hub().unsubscribe(&hub_id, &session_id).await;
            ServerMessage::Unsubscribed { session_id }
        }

        ClientMessage::Submit { request_id, op_type, data } => {
            let request = OperationRequest::new(client_id.clone(), op_type, data);
            match engine.submit_operation(request).await {
                Ok(sequence) => ServerMessage::Submitted { request_id, sequence },
                Err(e) => ServerMessage::rejected(Some(request_id), &e),
            }
        }

        ClientMessage::FullSync { request_id } => {
            let full = engine.full_sync();
            ServerMessage::FullSync {
                request_id,
                operations: full.operations,
                current_sequence: full.current_sequence,
            }
        }

        ClientMessage::Missing { request_id, from, to } => match engine.get_missing_operations(from, to) {
            Ok(operations) => ServerMessage::Operations { request_id, operations },
            Err(e) => ServerMessage::rejected(Some(request_id), &e),
        },

        ClientMessage::Stats { request_id } => ServerMessage::Stats {
            request_id,
            stats: engine.stats(),
        },

        ClientMessage::Ping => ServerMessage::Pong,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationType;
    use crate::oplog::DEFAULT_MAX_MISSING_RANGE;
    use serde_json::{json, Map, Value};

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_clients, 1024);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.engine.coordinate_bound, 12.0);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_respond_submit_and_reject() {
        let engine = SceneEngine::start(EngineConfig::default());
        let (hub_id, _rx) = engine.hub().connect("test").await;
        let mut client_id = "alice".to_string();

        let reply = respond(
            &engine,
            hub_id,
            &mut client_id,
            ClientMessage::Submit {
                request_id: 1,
                op_type: OperationType::SessionCreate.to_string(),
                data: Map::new(),
            },
        )
        .await;
        assert_eq!(reply, ServerMessage::Submitted { request_id: 1, sequence: 1 });
        assert_eq!(engine.get_all_operations()[0].client_id, "alice");

        let reply = respond(
            &engine,
            hub_id,
            &mut client_id,
            ClientMessage::Submit {
                request_id: 2,
                op_type: "object_create".into(),
                data: data(json!({ "session_id": uuid::Uuid::new_v4(), "name": "x" })),
            },
        )
        .await;
        match reply {
            ServerMessage::Rejected { request_id, kind, retryable, .. } => {
                assert_eq!(request_id, Some(2));
                assert_eq!(kind, ErrorKind::Validation);
                assert!(!retryable);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_respond_hello_and_subscribe_unknown() {
        let engine = SceneEngine::start(EngineConfig::default());
        let (hub_id, _rx) = engine.hub().connect("test").await;
        let mut client_id = hub_id.to_string();

        let reply = respond(&engine, hub_id, &mut client_id, ClientMessage::Hello { client_id: "bob".into() }).await;
        assert_eq!(
            reply,
            ServerMessage::Welcome {
                client_id: "bob".into(),
                current_sequence: 0,
                max_missing_range: DEFAULT_MAX_MISSING_RANGE,
            }
        );
        assert_eq!(client_id, "bob");

        let reply = respond(
            &engine,
            hub_id,
            &mut client_id,
            ClientMessage::Subscribe { session_id: uuid::Uuid::new_v4() },
        )
        .await;
        assert!(matches!(reply, ServerMessage::Rejected { kind: ErrorKind::NotFound, .. }));
    }
}
