//! Fan-out of committed operations and events to connected clients.
//!
//! Each client owns one bounded mpsc queue, drained by that client's own
//! connection task. Senders never wait: a full queue drops the message for
//! that client only, and a closed queue unregisters the client. Delivery is
//! therefore at-most-once and best-effort, but ordered per client.
//!
//! Stats are tracked via atomics so that `stats()` never takes the
//! subscriber lock.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Identifier the hub assigns to each connected client.
pub type ClientId = Uuid;

/// Envelope type used for committed operations.
pub const OPERATION_EVENT: &str = "operation";

/// Outbound `{type, payload}` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            session_id: None,
            payload,
        }
    }

    pub fn for_session(session_id: Uuid, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            session_id: Some(session_id),
            payload,
        }
    }
}

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_clients: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    active_clients: AtomicUsize,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            active_clients: AtomicUsize::new(0),
        }
    }
}

struct Subscriber {
    label: String,
    sessions: HashSet<Uuid>,
    tx: mpsc::Sender<Arc<Envelope>>,
}

enum Delivery {
    Sent,
    Dropped,
    Closed,
}

impl Subscriber {
    fn deliver(&self, envelope: &Arc<Envelope>) -> Delivery {
        match self.tx.try_send(envelope.clone()) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

pub struct BroadcastHub {
    clients: RwLock<HashMap<ClientId, Subscriber>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastHub {
    /// `capacity` is the per-client queue depth before messages are dropped.
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicBroadcastStats::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a client and hand back the receiving end of its queue.
    pub async fn connect(&self, label: impl Into<String>) -> (ClientId, mpsc::Receiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        let subscriber = Subscriber {
            label: label.into(),
            sessions: HashSet::new(),
            tx,
        };
        log::debug!("hub: client {id} ({}) connected", subscriber.label);
        self.clients.write().await.insert(id, subscriber);
        self.stats.active_clients.fetch_add(1, Ordering::Relaxed);
        (id, rx)
    }

    /// Unregister a client. Messages still queued for it are discarded.
    pub async fn disconnect(&self, client_id: &ClientId) -> bool {
        let removed = self.clients.write().await.remove(client_id);
        match removed {
            Some(subscriber) => {
                self.stats.active_clients.fetch_sub(1, Ordering::Relaxed);
                log::debug!("hub: client {client_id} ({}) disconnected", subscriber.label);
                true
            }
            None => false,
        }
    }

    pub async fn subscribe(&self, client_id: &ClientId, session_id: Uuid) -> bool {
        match self.clients.write().await.get_mut(client_id) {
            Some(subscriber) => {
                subscriber.sessions.insert(session_id);
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe(&self, client_id: &ClientId, session_id: &Uuid) -> bool {
        match self.clients.write().await.get_mut(client_id) {
            Some(subscriber) => subscriber.sessions.remove(session_id),
            None => false,
        }
    }

    pub async fn is_subscribed(&self, client_id: &ClientId, session_id: &Uuid) -> bool {
        self.clients
            .read()
            .await
            .get(client_id)
            .is_some_and(|s| s.sessions.contains(session_id))
    }

    /// Drop a session from every subscription set.
    pub async fn forget_session(&self, session_id: &Uuid) {
        for subscriber in self.clients.write().await.values_mut() {
            subscriber.sessions.remove(session_id);
        }
    }

    /// Deliver to every connected client.
    pub async fn broadcast_message(&self, envelope: Envelope) -> usize {
        self.fan_out(Arc::new(envelope), |_| true).await
    }

    /// Deliver only to clients subscribed to `session_id`.
    pub async fn broadcast_to_session(&self, session_id: Uuid, kind: &str, payload: Value) -> usize {
        let envelope = Arc::new(Envelope::for_session(session_id, kind, payload));
        self.fan_out(envelope, |s| s.sessions.contains(&session_id)).await
    }

    /// Global update of the given type, delivered to every client.
    pub async fn broadcast_update(&self, kind: &str, payload: Value) -> usize {
        self.broadcast_message(Envelope::new(kind, payload)).await
    }

    /// Deliver to matching clients; returns how many accepted the message.
    async fn fan_out(&self, envelope: Arc<Envelope>, wants: impl Fn(&Subscriber) -> bool) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, subscriber) in clients.iter().filter(|(_, s)| wants(s)) {
                match subscriber.deliver(&envelope) {
                    Delivery::Sent => delivered += 1,
                    Delivery::Dropped => {
                        self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "hub: queue full for client {id} ({}), dropped '{}'",
                            subscriber.label,
                            envelope.kind
                        );
                    }
                    Delivery::Closed => closed.push(*id),
                }
            }
        }
        self.stats.messages_sent.fetch_add(delivered as u64, Ordering::Relaxed);

        for id in closed {
            log::info!("hub: client {id} queue closed, unregistering");
            self.disconnect(&id).await;
        }
        delivered
    }

    pub fn client_count(&self) -> usize {
        self.stats.active_clients.load(Ordering::Relaxed)
    }

    /// Lock-free snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_clients: self.client_count(),
        }
    }
}
