//! # scene-sync: State synchronization for a shared 3D scene
//!
//! Keeps many clients consistent over one authoritative scene: a bounded
//! spatial store, general-purpose entities, avatar presence reconciled
//! with version vectors, a totally ordered operation log, and live fan-out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer                   │
//! │ + Replica   │     JSON frames    │   └─ SceneEngine             │
//! └─────────────┘                    │        ├─ SceneStore         │
//!                                    │        ├─ OperationLog       │
//!                                    │        └─ BroadcastHub       │
//!                                    └──────────────────────────────┘
//! ```
//!
//! Every accepted mutation is applied to the store and assigned the next
//! sequence number in one step; rejected mutations leave no trace. Late or
//! reconnecting clients catch up by replaying logged operations (full sync
//! or a missing range) instead of re-deriving state.
//!
//! ## Modules
//!
//! - [`spatial`]: coordinates and the closed `[-12, 12]` bound
//! - [`operation`]: operation types and typed payloads
//! - [`store`]: sessions, objects, entities, avatars
//! - [`oplog`]: sequencing, missing ranges, full sync
//! - [`broadcast`]: per-client bounded queues, drop on overflow
//! - [`engine`]: the context object tying the above together
//! - [`protocol`]: JSON wire messages
//! - [`server`] / [`client`]: WebSocket transport
//! - [`replica`]: client-side mirror with gap recovery

pub mod broadcast;
pub mod client;
pub mod engine;
pub mod error;
pub mod operation;
pub mod oplog;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod spatial;
pub mod store;

// Re-exports for convenience
pub use broadcast::{BroadcastHub, BroadcastStats, ClientId, Envelope, OPERATION_EVENT};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use engine::{EngineConfig, OperationRequest, SceneEngine, SyncStats};
pub use error::{ErrorKind, Result, SyncError};
pub use operation::{
    AvatarMove, AvatarRegister, EntityPatch, EntitySpec, Mutation, ObjectPatch, Operation, OperationType, Scope,
};
pub use oplog::{FullSync, LogStats, OperationLog};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use replica::{Ingest, Replica, DEFAULT_MAX_PENDING};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use spatial::{Axis, Bounds, Vec3, COORDINATE_BOUND};
pub use store::{
    AvatarState, Effect, Entity, MergeDecision, MoveOutcome, Object, SceneStore, Session, VersionVector, World,
    AVATAR_TAG,
};
