//! Error taxonomy for the synchronization engine.
//!
//! Every rejection happens before an operation is sequenced, so a caller that
//! receives an error knows nothing was admitted to the log. The HTTP layer (or
//! any other front end) maps [`ErrorKind`] to its own status codes.

use thiserror::Error;
use uuid::Uuid;

use crate::spatial::Axis;

/// Coarse classification of a [`SyncError`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed operation: unknown type tag, missing or ill-typed field.
    Validation,
    /// A coordinate fell outside the closed bound.
    CoordinateBounds,
    /// Unknown session, object, entity or avatar.
    NotFound,
    /// The mutation collides with existing state (duplicate name or id).
    Conflict,
    /// Lock acquisition timed out; resubmitting the identical operation is safe.
    Transient,
}

/// Errors produced by the store, the operation log and the engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("invalid operation: {0}")]
    Validation(String),

    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),

    #[error("coordinate {axis}={value} outside [-{bound}, {bound}]")]
    CoordinateOutOfBounds { axis: Axis, value: f64, bound: f64 },

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("session already exists: {0}")]
    SessionExists(Uuid),

    #[error("object '{name}' not found in session {session_id}")]
    ObjectNotFound { session_id: Uuid, name: String },

    #[error("object '{name}' already exists in session {session_id}")]
    DuplicateObject { session_id: Uuid, name: String },

    #[error("entity '{entity_id}' not found in session {session_id}")]
    EntityNotFound { session_id: Uuid, entity_id: String },

    #[error("entity '{entity_id}' already exists in session {session_id}")]
    DuplicateEntity { session_id: Uuid, entity_id: String },

    #[error("avatar for '{participant}' not found in session {session_id}")]
    AvatarNotFound { session_id: Uuid, participant: String },

    #[error("range [{from}, {to}] spans more than {max} operations")]
    RangeTooLarge { from: u64, to: u64, max: u64 },

    #[error("timed out acquiring {resource} lock")]
    LockTimeout { resource: &'static str },
}

impl SyncError {
    /// Classify this error for callers that only care about the category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::UnknownOperationType(_) | Self::RangeTooLarge { .. } => {
                ErrorKind::Validation
            }
            Self::CoordinateOutOfBounds { .. } => ErrorKind::CoordinateBounds,
            Self::SessionNotFound(_)
            | Self::ObjectNotFound { .. }
            | Self::EntityNotFound { .. }
            | Self::AvatarNotFound { .. } => ErrorKind::NotFound,
            Self::SessionExists(_) | Self::DuplicateObject { .. } | Self::DuplicateEntity { .. } => {
                ErrorKind::Conflict
            }
            Self::LockTimeout { .. } => ErrorKind::Transient,
        }
    }

    /// Whether resubmitting the identical request may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
