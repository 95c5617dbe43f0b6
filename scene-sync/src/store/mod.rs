//! In-memory scene store.
//!
//! ```text
//! SceneStore
//!   └─ RwLock<HashMap<Uuid, Arc<RwLock<Session>>>>   (session arena)
//!         └─ Session { objects, entities, avatars, world, scene }
//! ```
//!
//! Session lifecycle takes the arena write lock. Everything else takes the
//! arena read lock plus the write lock of the one session it touches, so
//! unrelated sessions never contend. Every acquisition is bounded by the
//! configured lock timeout and fails with a retryable `LockTimeout`.
//!
//! The store knows nothing about sequencing. [`SceneStore::apply_then`] runs
//! a caller-supplied commit step while the relevant lock is still held; the
//! engine uses it to append to the operation log so that log order matches
//! the order in which effects were applied. The commit step is handed the
//! mutation as actually applied, with defaults such as an avatar move's
//! counter made explicit, so the logged payload replays to the same state
//! no matter how often it is applied.

pub mod avatar;
pub mod entity;
pub mod session;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::operation::{Mutation, OpContext, Operation};
use crate::spatial::Bounds;

pub use avatar::{AvatarState, MergeDecision, MoveOutcome, VersionVector};
pub use entity::{Entity, AVATAR_TAG};
pub use session::{Effect, Object, Session, World};

type SessionCell = Arc<RwLock<Session>>;

pub struct SceneStore {
    sessions: RwLock<HashMap<Uuid, SessionCell>>,
    bounds: Bounds,
    lock_timeout: Duration,
}

impl SceneStore {
    pub fn new(bounds: Bounds, lock_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            bounds,
            lock_timeout,
        }
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    async fn acquire<F: Future>(&self, resource: &'static str, fut: F) -> Result<F::Output> {
        tokio::time::timeout(self.lock_timeout, fut)
            .await
            .map_err(|_| SyncError::LockTimeout { resource })
    }

    /// Apply a decoded mutation and, on success only, run `commit` before
    /// releasing the lock that guarded the effect.
    ///
    /// `prepare` sees the mutation with store-assigned defaults filled in and
    /// runs before anything changes; if it fails nothing is applied.
    pub async fn apply_then<P, T>(
        &self,
        mutation: &Mutation,
        ctx: &OpContext<'_>,
        prepare: impl FnOnce(&Mutation) -> Result<P>,
        commit: impl FnOnce(P) -> T,
    ) -> Result<(Effect, T)> {
        match mutation {
            Mutation::SessionCreate(p) => {
                let mut sessions = self.acquire("session registry", self.sessions.write()).await?;
                if sessions.contains_key(&p.session_id) {
                    return Err(SyncError::SessionExists(p.session_id));
                }
                let prepared = prepare(mutation)?;
                let session = Session::new(p.session_id, p.world_id.clone(), ctx.timestamp);
                sessions.insert(session.id, Arc::new(RwLock::new(session.clone())));
                Ok((Effect::Session(session), commit(prepared)))
            }
            Mutation::SessionDelete(p) => {
                let mut sessions = self.acquire("session registry", self.sessions.write()).await?;
                if !sessions.contains_key(&p.session_id) {
                    return Err(SyncError::SessionNotFound(p.session_id));
                }
                let prepared = prepare(mutation)?;
                sessions.remove(&p.session_id);
                Ok((Effect::SessionDeleted(p.session_id), commit(prepared)))
            }
            _ => {
                let session_id = mutation.session_id();
                let sessions = self.acquire("session registry", self.sessions.read()).await?;
                let cell = sessions
                    .get(&session_id)
                    .ok_or(SyncError::SessionNotFound(session_id))?;
                let mut session = self.acquire("session", cell.write()).await?;
                let resolved = session.resolve(mutation, ctx)?;
                let prepared = prepare(&resolved)?;
                let effect = session.apply(&resolved, ctx, &self.bounds)?;
                Ok((effect, commit(prepared)))
            }
        }
    }

    /// Apply an already-sequenced operation, as a replica or a replay does.
    pub async fn apply(&self, op: &Operation) -> Result<Effect> {
        let mutation = Mutation::decode(op.op_type, &op.data)?;
        let (effect, ()) = self
            .apply_then(&mutation, &op.context(), |_| Ok(()), |()| ())
            .await?;
        Ok(effect)
    }

    /// Apply operations in order, stopping at the first failure.
    pub async fn replay<'a>(&self, ops: impl IntoIterator<Item = &'a Operation>) -> Result<usize> {
        let mut applied = 0;
        for op in ops {
            self.apply(op).await.map_err(|e| {
                log::warn!("replay stopped at sequence {}: {e}", op.sequence);
                e
            })?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Drop every session.
    pub async fn clear(&self) -> Result<()> {
        let mut sessions = self.acquire("session registry", self.sessions.write()).await?;
        sessions.clear();
        Ok(())
    }

    /// Consistent copy of the whole store, ordered by session id.
    ///
    /// Every session's read lock is held before anything is cloned, so the
    /// copy is the store as of one instant: a prefix of the applied
    /// operations, never a mix of states from different moments.
    pub async fn snapshot(&self) -> Result<BTreeMap<Uuid, Session>> {
        let sessions = self.acquire("session registry", self.sessions.read()).await?;
        let mut guards = Vec::with_capacity(sessions.len());
        for (id, cell) in sessions.iter() {
            guards.push((*id, self.acquire("session", cell.read()).await?));
        }
        Ok(guards.iter().map(|(id, session)| (*id, (**session).clone())).collect())
    }

    /// Run `f` against one session under its read lock.
    async fn read_session<T>(&self, session_id: Uuid, f: impl FnOnce(&Session) -> T) -> Result<T> {
        let sessions = self.acquire("session registry", self.sessions.read()).await?;
        let cell = sessions
            .get(&session_id)
            .ok_or(SyncError::SessionNotFound(session_id))?;
        let session = self.acquire("session", cell.read()).await?;
        Ok(f(&session))
    }

    // ─── Reads ─────────────────────────────────────────────────────

    pub async fn session_count(&self) -> Result<usize> {
        Ok(self.acquire("session registry", self.sessions.read()).await?.len())
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        match self.read_session(session_id, Session::clone).await {
            Ok(session) => Ok(Some(session)),
            Err(SyncError::SessionNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.snapshot().await?.into_values().collect())
    }

    pub async fn get_object(&self, session_id: Uuid, name: &str) -> Result<Option<Object>> {
        self.read_session(session_id, |s| s.object(name).cloned()).await
    }

    pub async fn list_objects(&self, session_id: Uuid) -> Result<Vec<Object>> {
        self.read_session(session_id, |s| s.objects().cloned().collect()).await
    }

    pub async fn get_world(&self, session_id: Uuid) -> Result<Option<World>> {
        self.read_session(session_id, |s| s.world.clone()).await
    }

    pub async fn get_entity(&self, session_id: Uuid, entity_id: &str) -> Result<Option<Entity>> {
        self.read_session(session_id, |s| s.entity(entity_id).cloned()).await
    }

    pub async fn get_entities(&self, session_id: Uuid) -> Result<Vec<Entity>> {
        self.read_session(session_id, |s| s.entities().cloned().collect()).await
    }

    pub async fn get_avatar(&self, session_id: Uuid, participant: &str) -> Result<Option<AvatarState>> {
        self.read_session(session_id, |s| s.avatar(participant).cloned()).await
    }

    pub async fn list_avatars(&self, session_id: Uuid) -> Result<Vec<AvatarState>> {
        self.read_session(session_id, |s| s.avatars().cloned().collect()).await
    }
}

impl Default for SceneStore {
    fn default() -> Self {
        Self::new(Bounds::default(), Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationType;
    use serde_json::{json, Map, Value};

    fn op(op_type: OperationType, data: Value) -> Operation {
        let data: Map<String, Value> = match data {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        };
        Operation::new("test-client", op_type, data)
    }

    async fn store_with_session() -> (SceneStore, Uuid) {
        let store = SceneStore::default();
        let id = Uuid::new_v4();
        store
            .apply(&op(OperationType::SessionCreate, json!({ "session_id": id })))
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_commit_runs_only_on_success() {
        let (store, id) = store_with_session().await;
        let far = op(OperationType::ObjectCreate, json!({
            "session_id": id, "name": "far", "type": "cube", "x": 0.0, "y": 0.0, "z": 99.0
        }));
        let bad = Mutation::decode(far.op_type, &far.data).unwrap();
        let mut committed = false;
        let ctx = OpContext { client_id: "c1", timestamp: chrono::Utc::now() };
        let result = store
            .apply_then(&bad, &ctx, |_| Ok(()), |()| committed = true)
            .await;
        assert!(result.is_err());
        assert!(!committed);
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let store = SceneStore::default();
        let err = store
            .apply(&op(OperationType::AvatarClear, json!({ "session_id": Uuid::new_v4() })))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionNotFound(_)));
        assert!(store.get_session(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let (store, id) = store_with_session().await;
        let err = store
            .apply(&op(OperationType::SessionCreate, json!({ "session_id": id })))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::SessionExists(id));
        assert_eq!(store.session_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_session_delete_cascades() {
        let (store, id) = store_with_session().await;
        store
            .apply(&op(OperationType::ObjectCreate, json!({
                "session_id": id, "name": "beacon", "type": "sphere", "x": 0.0, "y": 2.0, "z": 0.0
            })))
            .await
            .unwrap();
        store
            .apply(&op(OperationType::AvatarRegister, json!({ "session_id": id, "participant": "alice" })))
            .await
            .unwrap();
        store
            .apply(&op(OperationType::SessionDelete, json!({ "session_id": id })))
            .await
            .unwrap();

        assert!(store.get_session(id).await.unwrap().is_none());
        assert!(matches!(store.list_objects(id).await, Err(SyncError::SessionNotFound(_))));
        assert!(matches!(store.get_avatar(id, "alice").await, Err(SyncError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_replay_rebuilds_identical_state() {
        let id = Uuid::new_v4();
        let ops = vec![
            op(OperationType::SessionCreate, json!({ "session_id": id })),
            op(OperationType::ObjectCreate, json!({
                "session_id": id, "name": "beacon", "type": "sphere", "x": 0.0, "y": 2.0, "z": 0.0
            })),
            op(OperationType::EntityCreate, json!({
                "session_id": id, "entity": { "id": "lamp", "components": { "light": { "on": true } } }
            })),
            op(OperationType::SceneUpdate, json!({ "session_id": id, "properties": { "sky": "dusk" } })),
        ];

        let first = SceneStore::default();
        assert_eq!(first.replay(&ops).await.unwrap(), 4);
        let second = SceneStore::default();
        second.replay(&ops).await.unwrap();
        assert_eq!(first.snapshot().await.unwrap(), second.snapshot().await.unwrap());
        assert_eq!(
            first.get_entity(id, "lamp").await.unwrap().unwrap().component("light"),
            Some(&json!({ "on": true }))
        );
    }

    #[tokio::test]
    async fn test_lock_timeout_is_retryable() {
        let store = SceneStore::new(Bounds::default(), Duration::from_millis(20));
        let held = store.sessions.write().await;
        let err = store
            .apply(&op(OperationType::SessionCreate, json!({ "session_id": Uuid::new_v4() })))
            .await
            .unwrap_err();
        drop(held);
        assert!(err.is_retryable());
        assert_eq!(store.session_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_waits_for_every_session() {
        let store = SceneStore::new(Bounds::default(), Duration::from_millis(20));
        let (busy, idle) = (Uuid::new_v4(), Uuid::new_v4());
        for id in [busy, idle] {
            store
                .apply(&op(OperationType::SessionCreate, json!({ "session_id": id })))
                .await
                .unwrap();
        }
        let cell = store.sessions.read().await.get(&busy).unwrap().clone();
        let held = cell.write().await;
        let err = store.snapshot().await.unwrap_err();
        drop(held);
        assert!(err.is_retryable());
        assert_eq!(store.snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let (store, _) = store_with_session().await;
        store.clear().await.unwrap();
        assert!(store.list_sessions().await.unwrap().is_empty());
    }
}
