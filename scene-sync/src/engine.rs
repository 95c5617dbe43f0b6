//! The synchronization engine: store, operation log and broadcast hub behind
//! one context object.
//!
//! ```text
//! OperationRequest ─► parse type ─► Mutation::decode ─► SceneStore::apply_then
//!                                                            │ (lock held)
//!                                                            ▼
//!                                                   OperationLog::append
//!                                                            │ listener
//!                                                            ▼
//!                                   dispatcher task ─► BroadcastHub fan-out
//! ```
//!
//! Rejected requests never reach the log, so a sequence number is only ever
//! assigned to an operation whose effect is already visible in the store.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broadcast::{BroadcastHub, Envelope, OPERATION_EVENT};
use crate::error::{ErrorKind, Result, SyncError};
use crate::operation::{
    AvatarMove, AvatarRegister, AvatarTarget, EntityCreate, EntityDelete, EntityPatch, EntitySpec,
    EntityUpdate, Mutation, ObjectCreate, ObjectPatch, ObjectTarget, ObjectUpdate, OpContext,
    Operation, OperationType, Scope, SceneUpdate, SessionCreate, SessionTarget, WorldInit,
};
use crate::oplog::{FullSync, OperationLog, DEFAULT_MAX_MISSING_RANGE};
use crate::spatial::{Bounds, Vec3, COORDINATE_BOUND};
use crate::store::{AvatarState, Effect, Entity, MoveOutcome, Object, SceneStore, Session, World};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Half-extent of the scene on every axis
    pub coordinate_bound: f64,
    /// Largest span a missing-range request may cover
    pub max_missing_range: u64,
    /// Upper bound on waiting for a store lock
    pub lock_timeout: Duration,
    /// Outbound queue depth per connected client
    pub client_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coordinate_bound: COORDINATE_BOUND,
            max_missing_range: DEFAULT_MAX_MISSING_RANGE,
            lock_timeout: Duration::from_secs(2),
            client_queue_capacity: 256,
        }
    }
}

/// A normalized inbound operation, as handed over by a front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub client_id: String,
    /// Raw type tag; unknown tags are rejected as validation errors.
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl OperationRequest {
    pub fn new(client_id: impl Into<String>, op_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            client_id: client_id.into(),
            op_type: op_type.into(),
            data,
        }
    }
}

/// Engine-wide counters. Built from atomics only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_operations: u64,
    pub current_sequence: u64,
    pub by_type: BTreeMap<OperationType, u64>,
    pub connected_clients: usize,
    pub messages_sent: u64,
    pub dropped_deliveries: u64,
}

pub struct SceneEngine {
    config: EngineConfig,
    store: SceneStore,
    log: OperationLog,
    hub: Arc<BroadcastHub>,
}

impl SceneEngine {
    /// Build the engine and spawn its dispatcher task.
    ///
    /// Must be called from within a tokio runtime. The dispatcher exits once
    /// the engine is dropped.
    pub fn start(config: EngineConfig) -> Arc<Self> {
        let hub = Arc::new(BroadcastHub::new(config.client_queue_capacity));
        let engine = Arc::new(Self {
            store: SceneStore::new(Bounds::new(config.coordinate_bound), config.lock_timeout),
            log: OperationLog::new(config.max_missing_range),
            hub: hub.clone(),
            config,
        });
        let operations = engine.log.add_listener();
        tokio::spawn(dispatch(hub, operations));
        log::info!(
            "scene engine started (bound ±{}, max range {}, lock timeout {:?})",
            engine.config.coordinate_bound,
            engine.config.max_missing_range,
            engine.config.lock_timeout
        );
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SceneStore {
        &self.store
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    // ─── Submission ────────────────────────────────────────────────

    /// Validate, apply and sequence an operation. Returns its sequence number.
    pub async fn submit_operation(&self, request: OperationRequest) -> Result<u64> {
        let op_type: OperationType = request.op_type.parse()?;
        let mut data = request.data;
        if op_type == OperationType::SessionCreate && !data.contains_key("session_id") {
            data.insert("session_id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        let mutation = Mutation::decode(op_type, &data)?;
        let (op, _) = self.commit(&request.client_id, mutation).await?;
        Ok(op.sequence)
    }

    async fn commit(&self, client_id: &str, mutation: Mutation) -> Result<(Arc<Operation>, Effect)> {
        let ctx = OpContext {
            client_id,
            timestamp: Utc::now(),
        };
        // The log records the resolved mutation, not the request as submitted.
        let prepare = |resolved: &Mutation| -> Result<Operation> {
            let mut op = Operation::new(client_id, resolved.op_type(), resolved.to_data()?);
            op.timestamp = ctx.timestamp;
            Ok(op)
        };
        let result = self
            .store
            .apply_then(&mutation, &ctx, prepare, |op| self.log.append(op))
            .await;

        match result {
            Ok((effect, op)) => {
                log::debug!("#{} {} from {}", op.sequence, op.op_type, op.client_id);
                Ok((op, effect))
            }
            Err(e) => {
                log::debug!("rejected {} from {client_id}: {e}", mutation.op_type());
                Err(e)
            }
        }
    }

    async fn submit_as<T>(
        &self,
        client_id: &str,
        mutation: Mutation,
        extract: impl FnOnce(Effect) -> Option<T>,
    ) -> Result<T> {
        let op_type = mutation.op_type();
        let (_, effect) = self.commit(client_id, mutation).await?;
        extract(effect).ok_or_else(|| SyncError::Validation(format!("{op_type} produced an unexpected effect")))
    }

    // ─── Synchronization protocol ──────────────────────────────────

    pub fn full_sync(&self) -> FullSync {
        self.log.full_sync()
    }

    pub fn get_missing_operations(&self, from: u64, to: u64) -> Result<Vec<Operation>> {
        self.log.get_missing_operations(from, to)
    }

    pub fn get_all_operations(&self) -> Vec<Operation> {
        self.log.get_all_operations()
    }

    pub fn current_sequence(&self) -> u64 {
        self.log.current_sequence()
    }

    pub fn stats(&self) -> SyncStats {
        let log = self.log.stats();
        let hub = self.hub.stats();
        SyncStats {
            total_operations: log.total_operations,
            current_sequence: log.current_sequence,
            by_type: log.by_type,
            connected_clients: hub.active_clients,
            messages_sent: hub.messages_sent,
            dropped_deliveries: hub.messages_dropped,
        }
    }

    // ─── Sessions ──────────────────────────────────────────────────

    pub async fn create_session(&self, client_id: &str, world_id: Option<String>) -> Result<Session> {
        let mutation = Mutation::SessionCreate(SessionCreate {
            session_id: Uuid::new_v4(),
            world_id,
        });
        self.submit_as(client_id, mutation, |e| match e {
            Effect::Session(s) => Some(s),
            _ => None,
        })
        .await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        self.store.get_session(session_id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.store.list_sessions().await
    }

    /// Delete a session and everything it owns. `false` if it did not exist.
    pub async fn delete_session(&self, client_id: &str, session_id: Uuid) -> Result<bool> {
        let mutation = Mutation::SessionDelete(SessionTarget { session_id });
        found(self.commit(client_id, mutation).await)
    }

    // ─── Objects and world ─────────────────────────────────────────

    pub async fn create_object(
        &self,
        client_id: &str,
        session_id: Uuid,
        name: &str,
        object_type: &str,
        position: Vec3,
    ) -> Result<Object> {
        let mutation = Mutation::ObjectCreate(ObjectCreate {
            session_id,
            name: name.to_string(),
            object_type: object_type.to_string(),
            x: position.x,
            y: position.y,
            z: position.z,
        });
        self.submit_as(client_id, mutation, |e| match e {
            Effect::Object(o) => Some(o),
            _ => None,
        })
        .await
    }

    pub async fn get_object(&self, session_id: Uuid, name: &str) -> Result<Option<Object>> {
        self.store.get_object(session_id, name).await
    }

    pub async fn list_objects(&self, session_id: Uuid) -> Result<Vec<Object>> {
        self.store.list_objects(session_id).await
    }

    pub async fn update_object(
        &self,
        client_id: &str,
        session_id: Uuid,
        name: &str,
        fields: ObjectPatch,
    ) -> Result<Object> {
        let mutation = Mutation::ObjectUpdate(ObjectUpdate {
            session_id,
            name: name.to_string(),
            fields,
        });
        let mutation = revalidate(mutation)?;
        self.submit_as(client_id, mutation, |e| match e {
            Effect::Object(o) => Some(o),
            _ => None,
        })
        .await
    }

    pub async fn delete_object(&self, client_id: &str, session_id: Uuid, name: &str) -> Result<bool> {
        let mutation = Mutation::ObjectDelete(ObjectTarget {
            session_id,
            name: name.to_string(),
        });
        found(self.commit(client_id, mutation).await)
    }

    pub async fn initialize_world(
        &self,
        client_id: &str,
        session_id: Uuid,
        size: f64,
        transparency: f64,
        camera: Vec3,
    ) -> Result<World> {
        let mutation = Mutation::WorldInit(WorldInit {
            session_id,
            size,
            transparency,
            camera,
        });
        self.submit_as(client_id, mutation, |e| match e {
            Effect::World(w) => Some(w),
            _ => None,
        })
        .await
    }

    pub async fn update_scene(
        &self,
        client_id: &str,
        session_id: Uuid,
        properties: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mutation = Mutation::SceneUpdate(SceneUpdate { session_id, properties });
        self.submit_as(client_id, mutation, |e| match e {
            Effect::Scene(scene) => Some(scene),
            _ => None,
        })
        .await
    }

    // ─── Entities ──────────────────────────────────────────────────

    pub async fn add_entity(&self, client_id: &str, session_id: Uuid, entity: EntitySpec) -> Result<Entity> {
        self.create_entity(client_id, session_id, entity, None).await
    }

    /// Remove every entity tagged `tag`, then add `entity`, as one operation.
    pub async fn replace_tagged_entity(
        &self,
        client_id: &str,
        session_id: Uuid,
        tag: &str,
        entity: EntitySpec,
    ) -> Result<Entity> {
        self.create_entity(client_id, session_id, entity, Some(tag.to_string())).await
    }

    async fn create_entity(
        &self,
        client_id: &str,
        session_id: Uuid,
        entity: EntitySpec,
        replace_tag: Option<String>,
    ) -> Result<Entity> {
        let mutation = revalidate(Mutation::EntityCreate(EntityCreate {
            session_id,
            entity,
            replace_tag,
        }))?;
        self.submit_as(client_id, mutation, |e| match e {
            Effect::Entity(entity) => Some(entity),
            _ => None,
        })
        .await
    }

    pub async fn update_entity(
        &self,
        client_id: &str,
        session_id: Uuid,
        entity_id: &str,
        patch: EntityPatch,
    ) -> Result<Entity> {
        let mutation = revalidate(Mutation::EntityUpdate(EntityUpdate {
            session_id,
            entity_id: entity_id.to_string(),
            patch,
        }))?;
        self.submit_as(client_id, mutation, |e| match e {
            Effect::Entity(entity) => Some(entity),
            _ => None,
        })
        .await
    }

    pub async fn get_entities(&self, session_id: Uuid) -> Result<Vec<Entity>> {
        self.store.get_entities(session_id).await
    }

    pub async fn get_entity(&self, session_id: Uuid, entity_id: &str) -> Result<Option<Entity>> {
        self.store.get_entity(session_id, entity_id).await
    }

    pub async fn remove_entity(&self, client_id: &str, session_id: Uuid, entity_id: &str) -> Result<bool> {
        let mutation = Mutation::EntityDelete(EntityDelete {
            session_id,
            entity_id: Some(entity_id.to_string()),
            tag: None,
        });
        found(self.commit(client_id, mutation).await)
    }

    /// Remove every entity carrying `tag`; returns how many were removed.
    pub async fn remove_entities_by_tag(&self, client_id: &str, session_id: Uuid, tag: &str) -> Result<usize> {
        let mutation = Mutation::EntityDelete(EntityDelete {
            session_id,
            entity_id: None,
            tag: Some(tag.to_string()),
        });
        self.submit_as(client_id, mutation, |e| match e {
            Effect::EntitiesRemoved(removed) => Some(removed.len()),
            _ => None,
        })
        .await
    }

    // ─── Avatars ───────────────────────────────────────────────────

    pub async fn register_avatar(&self, client_id: &str, registration: AvatarRegister) -> Result<AvatarState> {
        let mutation = revalidate(Mutation::AvatarRegister(registration))?;
        self.submit_as(client_id, mutation, |e| match e {
            Effect::Avatar(avatar, _) => Some(avatar),
            _ => None,
        })
        .await
    }

    pub async fn move_avatar(&self, client_id: &str, update: AvatarMove) -> Result<(AvatarState, MoveOutcome)> {
        let mutation = revalidate(Mutation::AvatarMove(update))?;
        self.submit_as(client_id, mutation, |e| match e {
            Effect::Avatar(avatar, Some(outcome)) => Some((avatar, outcome)),
            _ => None,
        })
        .await
    }

    pub async fn get_avatar(&self, session_id: Uuid, participant: &str) -> Result<Option<AvatarState>> {
        self.store.get_avatar(session_id, participant).await
    }

    pub async fn list_avatars(&self, session_id: Uuid) -> Result<Vec<AvatarState>> {
        self.store.list_avatars(session_id).await
    }

    pub async fn remove_avatar(&self, client_id: &str, session_id: Uuid, participant: &str) -> Result<bool> {
        let mutation = Mutation::AvatarRemove(AvatarTarget {
            session_id,
            participant: participant.to_string(),
        });
        found(self.commit(client_id, mutation).await)
    }

    /// Drop every avatar record in the session; returns how many there were.
    pub async fn clear_avatar_world(&self, client_id: &str, session_id: Uuid) -> Result<usize> {
        let mutation = Mutation::AvatarClear(SessionTarget { session_id });
        self.submit_as(client_id, mutation, |e| match e {
            Effect::AvatarsRemoved(n) => Some(n),
            _ => None,
        })
        .await
    }
}

/// Run structural validation on a mutation built in code rather than decoded.
fn revalidate(mutation: Mutation) -> Result<Mutation> {
    Mutation::decode(mutation.op_type(), &mutation.to_data()?)
}

/// Map not-found to `Ok(false)` for boolean delete contracts.
fn found<T>(result: Result<T>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Forward every sequenced operation to the hub, in sequence order.
async fn dispatch(hub: Arc<BroadcastHub>, mut operations: mpsc::UnboundedReceiver<Arc<Operation>>) {
    while let Some(op) = operations.recv().await {
        let payload = match serde_json::to_value(&*op) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("failed to encode operation #{}: {e}", op.sequence);
                continue;
            }
        };
        match op.scope() {
            Scope::Session(session_id) => {
                hub.broadcast_to_session(session_id, OPERATION_EVENT, payload).await;
            }
            Scope::Global => {
                let session_id = op.session_id();
                if op.op_type == OperationType::SessionDelete {
                    if let Some(id) = session_id {
                        hub.forget_session(&id).await;
                    }
                }
                let envelope = Envelope {
                    kind: OPERATION_EVENT.to_string(),
                    session_id,
                    payload,
                };
                hub.broadcast_message(envelope).await;
            }
        }
    }
    log::debug!("operation dispatcher stopped");
}
