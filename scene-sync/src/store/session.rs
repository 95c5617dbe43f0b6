//! A session: one isolated scene owning its objects, entities and avatars.
//!
//! Every mutating method validates completely before it touches any field,
//! so an `Err` always leaves the session exactly as it was.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::avatar::{AvatarState, AvatarUpdate, FieldVersion, MoveOutcome};
use super::entity::Entity;
use crate::error::{Result, SyncError};
use crate::operation::{
    AvatarMove, AvatarRegister, EntityCreate, EntityDelete, EntityPatch, EntitySpec, Mutation,
    ObjectPatch, OpContext, WorldInit,
};
use crate::spatial::{Bounds, Vec3};

/// Legacy bounded spatial primitive, keyed by name within its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub name: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub position: Vec3,
    pub created_at: DateTime<Utc>,
}

/// World configuration set by `InitializeWorld`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    pub size: f64,
    pub transparency: f64,
    pub camera: Vec3,
}

/// What a successfully applied mutation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Session(Session),
    SessionDeleted(Uuid),
    Object(Object),
    ObjectDeleted(Object),
    Entity(Entity),
    EntitiesRemoved(Vec<Entity>),
    Avatar(AvatarState, Option<MoveOutcome>),
    AvatarsRemoved(usize),
    World(World),
    Scene(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub world_id: String,
    pub created_at: DateTime<Utc>,
    pub world: Option<World>,
    /// Scene-wide opaque properties (`scene_update`).
    pub scene: Map<String, Value>,
    objects: BTreeMap<String, Object>,
    entities: BTreeMap<String, Entity>,
    avatars: BTreeMap<String, AvatarState>,
}

impl Session {
    pub fn new(id: Uuid, world_id: Option<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            world_id: world_id.unwrap_or_else(|| id.to_string()),
            created_at,
            world: None,
            scene: Map::new(),
            objects: BTreeMap::new(),
            entities: BTreeMap::new(),
            avatars: BTreeMap::new(),
        }
    }

    // ─── Objects ───────────────────────────────────────────────────

    pub fn object(&self, name: &str) -> Option<&Object> {
        self.objects.get(name)
    }

    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Names are unique per session: a duplicate is rejected, never overwritten.
    pub fn create_object(
        &mut self,
        name: &str,
        object_type: &str,
        position: Vec3,
        bounds: &Bounds,
        created_at: DateTime<Utc>,
    ) -> Result<Object> {
        bounds.check(&position)?;
        if self.objects.contains_key(name) {
            return Err(SyncError::DuplicateObject {
                session_id: self.id,
                name: name.to_string(),
            });
        }
        let object = Object {
            name: name.to_string(),
            object_type: object_type.to_string(),
            position,
            created_at,
        };
        self.objects.insert(object.name.clone(), object.clone());
        Ok(object)
    }

    pub fn update_object(&mut self, name: &str, patch: &ObjectPatch, bounds: &Bounds) -> Result<Object> {
        let current = self.objects.get(name).ok_or_else(|| SyncError::ObjectNotFound {
            session_id: self.id,
            name: name.to_string(),
        })?;

        let position = Vec3::new(
            patch.x.unwrap_or(current.position.x),
            patch.y.unwrap_or(current.position.y),
            patch.z.unwrap_or(current.position.z),
        );
        bounds.check(&position)?;

        let mut updated = current.clone();
        updated.position = position;
        if let Some(object_type) = &patch.object_type {
            updated.object_type = object_type.clone();
        }
        self.objects.insert(name.to_string(), updated.clone());
        Ok(updated)
    }

    pub fn delete_object(&mut self, name: &str) -> Result<Object> {
        self.objects.remove(name).ok_or_else(|| SyncError::ObjectNotFound {
            session_id: self.id,
            name: name.to_string(),
        })
    }

    // ─── World ─────────────────────────────────────────────────────

    pub fn initialize_world(
        &mut self,
        size: f64,
        transparency: f64,
        camera: Vec3,
        bounds: &Bounds,
    ) -> Result<World> {
        bounds.check(&camera)?;
        if !(size.is_finite() && size > 0.0) {
            return Err(SyncError::Validation(format!("world size must be positive, got {size}")));
        }
        if !(0.0..=1.0).contains(&transparency) {
            return Err(SyncError::Validation(format!(
                "transparency must be within [0, 1], got {transparency}"
            )));
        }
        let world = World {
            size,
            transparency,
            camera,
        };
        self.world = Some(world.clone());
        Ok(world)
    }

    /// Merge scene-wide properties; `null` removes a property.
    pub fn update_scene(&mut self, properties: &Map<String, Value>) -> Map<String, Value> {
        for (key, value) in properties {
            if value.is_null() {
                self.scene.remove(key);
            } else {
                self.scene.insert(key.clone(), value.clone());
            }
        }
        self.scene.clone()
    }

    // ─── Entities ──────────────────────────────────────────────────

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn add_entity(&mut self, spec: &EntitySpec, created_at: DateTime<Utc>) -> Result<Entity> {
        if self.entities.contains_key(&spec.id) {
            return Err(SyncError::DuplicateEntity {
                session_id: self.id,
                entity_id: spec.id.clone(),
            });
        }
        let entity = Entity::from_spec(spec, created_at);
        self.entities.insert(entity.id.clone(), entity.clone());
        Ok(entity)
    }

    /// Add an entity after removing every entity carrying `tag`.
    ///
    /// The new entity may reuse the id of one it replaces.
    pub fn replace_tagged_entity(
        &mut self,
        tag: &str,
        spec: &EntitySpec,
        created_at: DateTime<Utc>,
    ) -> Result<Entity> {
        let collides = self
            .entities
            .get(&spec.id)
            .is_some_and(|existing| !existing.has_tag(tag));
        if collides {
            return Err(SyncError::DuplicateEntity {
                session_id: self.id,
                entity_id: spec.id.clone(),
            });
        }
        self.remove_entities_tagged(tag);
        self.add_entity(spec, created_at)
    }

    pub fn update_entity(&mut self, id: &str, patch: &EntityPatch) -> Result<Entity> {
        let entity = self.entities.get_mut(id).ok_or_else(|| SyncError::EntityNotFound {
            session_id: self.id,
            entity_id: id.to_string(),
        })?;
        entity.apply_patch(patch);
        Ok(entity.clone())
    }

    pub fn remove_entity(&mut self, id: &str) -> Result<Entity> {
        self.entities.remove(id).ok_or_else(|| SyncError::EntityNotFound {
            session_id: self.id,
            entity_id: id.to_string(),
        })
    }

    /// Remove every entity matching the tag predicate. Removing none is not an error.
    pub fn remove_entities_tagged(&mut self, tag: &str) -> Vec<Entity> {
        let ids: Vec<String> = self
            .entities
            .values()
            .filter(|e| e.has_tag(tag))
            .map(|e| e.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.entities.remove(id)).collect()
    }

    // ─── Avatars ───────────────────────────────────────────────────

    pub fn avatar(&self, participant: &str) -> Option<&AvatarState> {
        self.avatars.get(participant)
    }

    pub fn avatars(&self) -> impl Iterator<Item = &AvatarState> {
        self.avatars.values()
    }

    /// Register (or re-register) a participant's presence with fresh versions.
    pub fn register_avatar(&mut self, avatar: AvatarState, bounds: &Bounds) -> Result<AvatarState> {
        bounds.check(&avatar.position)?;
        self.avatars.insert(avatar.participant.clone(), avatar.clone());
        Ok(avatar)
    }

    pub fn move_avatar(
        &mut self,
        participant: &str,
        update: &AvatarUpdate,
        bounds: &Bounds,
    ) -> Result<(AvatarState, MoveOutcome)> {
        if let Some(position) = &update.position {
            bounds.check(position)?;
        }
        let avatar = self.avatars.get_mut(participant).ok_or_else(|| SyncError::AvatarNotFound {
            session_id: self.id,
            participant: participant.to_string(),
        })?;
        let outcome = avatar.merge(update);
        Ok((avatar.clone(), outcome))
    }

    pub fn remove_avatar(&mut self, participant: &str) -> Result<AvatarState> {
        self.avatars.remove(participant).ok_or_else(|| SyncError::AvatarNotFound {
            session_id: self.id,
            participant: participant.to_string(),
        })
    }

    /// ClearAvatarWorld: drop every avatar record in this session.
    pub fn clear_avatars(&mut self) -> usize {
        let count = self.avatars.len();
        self.avatars.clear();
        count
    }

    // ─── Mutation dispatch ─────────────────────────────────────────

    /// Apply a session-scoped mutation.
    pub(crate) fn apply(&mut self, mutation: &Mutation, ctx: &OpContext<'_>, bounds: &Bounds) -> Result<Effect> {
        match mutation {
            Mutation::ObjectCreate(p) => self
                .create_object(&p.name, &p.object_type, Vec3::new(p.x, p.y, p.z), bounds, ctx.timestamp)
                .map(Effect::Object),
            Mutation::ObjectUpdate(p) => self.update_object(&p.name, &p.fields, bounds).map(Effect::Object),
            Mutation::ObjectDelete(p) => self.delete_object(&p.name).map(Effect::ObjectDeleted),
            Mutation::EntityCreate(EntityCreate {
                entity,
                replace_tag,
                ..
            }) => match replace_tag {
                Some(tag) => self.replace_tagged_entity(tag, entity, ctx.timestamp),
                None => self.add_entity(entity, ctx.timestamp),
            }
            .map(Effect::Entity),
            Mutation::EntityUpdate(p) => self.update_entity(&p.entity_id, &p.patch).map(Effect::Entity),
            Mutation::EntityDelete(EntityDelete { entity_id, tag, .. }) => match (entity_id, tag) {
                (Some(id), _) => self.remove_entity(id).map(|e| Effect::EntitiesRemoved(vec![e])),
                (None, Some(tag)) => Ok(Effect::EntitiesRemoved(self.remove_entities_tagged(tag))),
                (None, None) => Err(SyncError::Validation("entity_delete needs a selector".into())),
            },
            Mutation::AvatarRegister(AvatarRegister {
                participant,
                position,
                rotation,
                animation,
                ..
            }) => {
                let mut avatar = AvatarState::new(participant.clone(), ctx.timestamp);
                avatar.position = *position;
                avatar.rotation = *rotation;
                avatar.animation = animation.clone();
                self.register_avatar(avatar, bounds).map(|a| Effect::Avatar(a, None))
            }
            Mutation::AvatarMove(p) => {
                let update = self.resolve_avatar_move(p, ctx)?;
                self.move_avatar(&p.participant, &update, bounds)
                    .map(|(a, outcome)| Effect::Avatar(a, Some(outcome)))
            }
            Mutation::AvatarRemove(p) => self
                .remove_avatar(&p.participant)
                .map(|a| Effect::Avatar(a, None)),
            Mutation::AvatarClear(_) => Ok(Effect::AvatarsRemoved(self.clear_avatars())),
            Mutation::WorldInit(WorldInit {
                size,
                transparency,
                camera,
                ..
            }) => self
                .initialize_world(*size, *transparency, *camera, bounds)
                .map(Effect::World),
            Mutation::SceneUpdate(p) => Ok(Effect::Scene(self.update_scene(&p.properties))),
            Mutation::SessionCreate(_) | Mutation::SessionDelete(_) => Err(SyncError::Validation(format!(
                "{} is not a session-scoped operation",
                mutation.op_type()
            ))),
        }
    }

    /// Rewrite `mutation` with every store-assigned default made explicit.
    ///
    /// Only `avatar_move` has such defaults. The resolved form is what gets
    /// logged, so applying a logged move a second time merges as a duplicate.
    pub(crate) fn resolve<'m>(&self, mutation: &'m Mutation, ctx: &OpContext<'_>) -> Result<Cow<'m, Mutation>> {
        match mutation {
            Mutation::AvatarMove(p) => {
                let FieldVersion {
                    origin,
                    counter,
                    timestamp,
                } = self.resolve_avatar_move(p, ctx)?.version;
                Ok(Cow::Owned(Mutation::AvatarMove(AvatarMove {
                    origin: Some(origin),
                    counter: Some(counter),
                    timestamp: Some(timestamp),
                    ..p.clone()
                })))
            }
            _ => Ok(Cow::Borrowed(mutation)),
        }
    }

    /// Fill in origin, counter and timestamp defaults for an avatar move.
    ///
    /// A missing counter becomes `stored + 1` for the origin. The stored
    /// counter depends only on earlier operations, so replay resolves it
    /// identically.
    fn resolve_avatar_move(&self, p: &AvatarMove, ctx: &OpContext<'_>) -> Result<AvatarUpdate> {
        let avatar = self.avatars.get(&p.participant).ok_or_else(|| SyncError::AvatarNotFound {
            session_id: self.id,
            participant: p.participant.clone(),
        })?;
        let origin = p.origin.clone().unwrap_or_else(|| ctx.client_id.to_string());
        let counter = match p.counter {
            Some(counter) => counter,
            None => avatar.counter_for(&origin) + 1,
        };
        Ok(AvatarUpdate {
            version: FieldVersion {
                origin,
                counter,
                timestamp: p.timestamp.unwrap_or(ctx.timestamp),
            },
            position: p.position,
            rotation: p.rotation,
            animation: p.animation.clone(),
        })
    }
}
