//! JSON wire protocol between `SyncClient` and `SyncServer`.
//!
//! Every WebSocket text frame carries one message, tagged by `"type"`:
//! ```text
//! client → server   hello | subscribe | unsubscribe | submit
//!                   full_sync | missing | stats | ping
//! server → client   welcome | subscribed | unsubscribed | submitted
//!                   rejected | full_sync | operations | stats | event | pong
//! ```
//!
//! Requests carry a client-chosen `request_id` that the matching response
//! echoes back. Live operations arrive as `event` frames whose envelope
//! payload is the same `Operation` shape returned by `full_sync`/`missing`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::broadcast::Envelope;
use crate::engine::SyncStats;
use crate::error::{ErrorKind, SyncError};
use crate::operation::Operation;
use crate::oplog::DEFAULT_MAX_MISSING_RANGE;

pub type RequestId = u64;

fn default_max_missing_range() -> u64 {
    DEFAULT_MAX_MISSING_RANGE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Announce the identity used as `client_id` on submitted operations.
    Hello { client_id: String },
    Subscribe { session_id: Uuid },
    Unsubscribe { session_id: Uuid },
    Submit {
        request_id: RequestId,
        op_type: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
    FullSync { request_id: RequestId },
    Missing { request_id: RequestId, from: u64, to: u64 },
    Stats { request_id: RequestId },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        client_id: String,
        current_sequence: u64,
        /// Widest `missing` span the server answers.
        #[serde(default = "default_max_missing_range")]
        max_missing_range: u64,
    },
    /// Live delivery for the session starts after `current_sequence`.
    Subscribed { session_id: Uuid, current_sequence: u64 },
    Unsubscribed { session_id: Uuid },
    Submitted { request_id: RequestId, sequence: u64 },
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
    FullSync {
        request_id: RequestId,
        operations: Vec<Operation>,
        current_sequence: u64,
    },
    Operations { request_id: RequestId, operations: Vec<Operation> },
    Stats { request_id: RequestId, stats: SyncStats },
    Event { envelope: Envelope },
    Pong,
}

impl ServerMessage {
    pub fn rejected(request_id: Option<RequestId>, error: &SyncError) -> Self {
        Self::Rejected {
            request_id,
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }

    /// Request this message answers, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Submitted { request_id, .. }
            | Self::FullSync { request_id, .. }
            | Self::Operations { request_id, .. }
            | Self::Stats { request_id, .. } => Some(*request_id),
            Self::Rejected { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

macro_rules! json_codec {
    ($ty:ty) => {
        impl $ty {
            pub fn encode(&self) -> Result<String, ProtocolError> {
                serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
            }

            pub fn decode(text: &str) -> Result<Self, ProtocolError> {
                serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
            }
        }
    };
}

json_codec!(ClientMessage);
json_codec!(ServerMessage);

/// Errors on the wire and connection level.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("request timed out")]
    Timeout,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("rejected ({kind:?}): {message}")]
    Rejected {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::ConnectionClosed,
            other => Self::WebSocket(other.to_string()),
        }
    }
}
