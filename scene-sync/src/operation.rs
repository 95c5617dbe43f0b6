//! Operations: the unit of the log.
//!
//! An [`Operation`] keeps its payload as an untyped JSON map so the log and
//! the wire share a single representation. Before anything touches the store
//! the payload is decoded into a typed [`Mutation`]; a payload that fails to
//! decode is a validation error and never reaches the log.
//!
//! ```text
//! {client_id, type, data}
//!        │  OperationType::parse
//!        ▼
//!   Mutation::decode ──► Session / registry apply ──► OperationLog::append
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::spatial::Vec3;

/// Closed set of operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OperationType {
    SessionCreate = 0,
    SessionDelete = 1,
    ObjectCreate = 2,
    ObjectUpdate = 3,
    ObjectDelete = 4,
    EntityCreate = 5,
    EntityUpdate = 6,
    EntityDelete = 7,
    AvatarRegister = 8,
    AvatarMove = 9,
    AvatarRemove = 10,
    AvatarClear = 11,
    WorldInit = 12,
    SceneUpdate = 13,
}

impl OperationType {
    pub const COUNT: usize = 14;

    pub const ALL: [OperationType; Self::COUNT] = [
        OperationType::SessionCreate,
        OperationType::SessionDelete,
        OperationType::ObjectCreate,
        OperationType::ObjectUpdate,
        OperationType::ObjectDelete,
        OperationType::EntityCreate,
        OperationType::EntityUpdate,
        OperationType::EntityDelete,
        OperationType::AvatarRegister,
        OperationType::AvatarMove,
        OperationType::AvatarRemove,
        OperationType::AvatarClear,
        OperationType::WorldInit,
        OperationType::SceneUpdate,
    ];

    /// Wire tag, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreate => "session_create",
            Self::SessionDelete => "session_delete",
            Self::ObjectCreate => "object_create",
            Self::ObjectUpdate => "object_update",
            Self::ObjectDelete => "object_delete",
            Self::EntityCreate => "entity_create",
            Self::EntityUpdate => "entity_update",
            Self::EntityDelete => "entity_delete",
            Self::AvatarRegister => "avatar_register",
            Self::AvatarMove => "avatar_move",
            Self::AvatarRemove => "avatar_remove",
            Self::AvatarClear => "avatar_clear",
            Self::WorldInit => "world_init",
            Self::SceneUpdate => "scene_update",
        }
    }

    /// Position in [`OperationType::ALL`], used to index per-type counters.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Session lifecycle operations touch the session arena and are visible
    /// to every client; everything else is scoped to one session.
    pub fn is_global(self) -> bool {
        matches!(self, Self::SessionCreate | Self::SessionDelete)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::UnknownOperationType(s.to_string()))
    }
}

/// Where an operation's effect lands, and therefore who hears about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Session(Uuid),
}

/// One admitted mutation. Immutable once the log has assigned `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Position in the total order; 0 until sequenced.
    pub sequence: u64,
    pub client_id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    /// Build an unsequenced operation stamped with the current time.
    pub fn new(client_id: impl Into<String>, op_type: OperationType, data: Map<String, Value>) -> Self {
        Self {
            sequence: 0,
            client_id: client_id.into(),
            op_type,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn is_sequenced(&self) -> bool {
        self.sequence > 0
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Session id named by the payload, if any.
    pub fn session_id(&self) -> Option<Uuid> {
        self.data
            .get("session_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn scope(&self) -> Scope {
        match self.session_id() {
            Some(id) if !self.op_type.is_global() => Scope::Session(id),
            _ => Scope::Global,
        }
    }

    pub fn context(&self) -> OpContext<'_> {
        OpContext {
            client_id: &self.client_id,
            timestamp: self.timestamp,
        }
    }
}

/// Submission metadata the store needs while applying a mutation.
///
/// Store effects take their timestamps from here, never from the wall clock,
/// so replaying the log reproduces identical state.
#[derive(Debug, Clone, Copy)]
pub struct OpContext<'a> {
    pub client_id: &'a str,
    pub timestamp: DateTime<Utc>,
}

// ───────────────────────────────────────────────────────────────────
// Typed payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCreate {
    pub session_id: Uuid,
    #[serde(default)]
    pub world_id: Option<String>,
}

/// Payload naming only a session (`session_delete`, `avatar_clear`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTarget {
    pub session_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCreate {
    pub session_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Fields of an object that `object_update` may change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl ObjectPatch {
    pub fn position(x: f64, y: f64, z: f64) -> Self {
        Self {
            object_type: None,
            x: Some(x),
            y: Some(y),
            z: Some(z),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.object_type.is_none() && self.x.is_none() && self.y.is_none() && self.z.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub session_id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub fields: ObjectPatch,
}

/// Payload naming one object (`object_delete`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectTarget {
    pub session_id: Uuid,
    pub name: String,
}

fn enabled_by_default() -> bool {
    true
}

/// Client-supplied description of a new entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub components: Map<String, Value>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl EntitySpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            components: Map::new(),
            tags: BTreeSet::new(),
            enabled: true,
        }
    }

    pub fn with_component(mut self, name: impl Into<String>, value: Value) -> Self {
        self.components.insert(name.into(), value);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCreate {
    pub session_id: Uuid,
    pub entity: EntitySpec,
    /// Remove every entity carrying this tag before adding the new one.
    #[serde(default)]
    pub replace_tag: Option<String>,
}

/// Changes `entity_update` may make. Component entries set to `null` are
/// removed; other entries overwrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub session_id: Uuid,
    pub entity_id: String,
    #[serde(flatten)]
    pub patch: EntityPatch,
}

/// Removal by identifier or by tag predicate; exactly one must be given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDelete {
    pub session_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarRegister {
    pub session_id: Uuid,
    pub participant: String,
    #[serde(default)]
    pub position: Vec3,
    #[serde(default)]
    pub rotation: Vec3,
    #[serde(default)]
    pub animation: String,
}

/// Avatar field update, merged through the per-field version vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarMove {
    pub session_id: Uuid,
    pub participant: String,
    /// Path that produced the update; defaults to the submitting client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Origin's counter; when absent the store assigns `stored + 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<String>,
    /// Origin-side timestamp; defaults to the submission timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Payload naming one avatar (`avatar_remove`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarTarget {
    pub session_id: Uuid,
    pub participant: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldInit {
    pub session_id: Uuid,
    pub size: f64,
    pub transparency: f64,
    pub camera: Vec3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneUpdate {
    pub session_id: Uuid,
    pub properties: Map<String, Value>,
}

/// Decoded, typed form of an operation payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    SessionCreate(SessionCreate),
    SessionDelete(SessionTarget),
    ObjectCreate(ObjectCreate),
    ObjectUpdate(ObjectUpdate),
    ObjectDelete(ObjectTarget),
    EntityCreate(EntityCreate),
    EntityUpdate(EntityUpdate),
    EntityDelete(EntityDelete),
    AvatarRegister(AvatarRegister),
    AvatarMove(AvatarMove),
    AvatarRemove(AvatarTarget),
    AvatarClear(SessionTarget),
    WorldInit(WorldInit),
    SceneUpdate(SceneUpdate),
}

fn decode_payload<T: DeserializeOwned>(op_type: OperationType, data: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(data.clone()))
        .map_err(|e| SyncError::Validation(format!("{op_type}: {e}")))
}

impl Mutation {
    /// Decode and structurally validate a payload for the given type.
    pub fn decode(op_type: OperationType, data: &Map<String, Value>) -> Result<Self> {
        let mutation = match op_type {
            OperationType::SessionCreate => Self::SessionCreate(decode_payload(op_type, data)?),
            OperationType::SessionDelete => Self::SessionDelete(decode_payload(op_type, data)?),
            OperationType::ObjectCreate => Self::ObjectCreate(decode_payload(op_type, data)?),
            OperationType::ObjectUpdate => Self::ObjectUpdate(decode_payload(op_type, data)?),
            OperationType::ObjectDelete => Self::ObjectDelete(decode_payload(op_type, data)?),
            OperationType::EntityCreate => Self::EntityCreate(decode_payload(op_type, data)?),
            OperationType::EntityUpdate => Self::EntityUpdate(decode_payload(op_type, data)?),
            OperationType::EntityDelete => Self::EntityDelete(decode_payload(op_type, data)?),
            OperationType::AvatarRegister => Self::AvatarRegister(decode_payload(op_type, data)?),
            OperationType::AvatarMove => Self::AvatarMove(decode_payload(op_type, data)?),
            OperationType::AvatarRemove => Self::AvatarRemove(decode_payload(op_type, data)?),
            OperationType::AvatarClear => Self::AvatarClear(decode_payload(op_type, data)?),
            OperationType::WorldInit => Self::WorldInit(decode_payload(op_type, data)?),
            OperationType::SceneUpdate => Self::SceneUpdate(decode_payload(op_type, data)?),
        };
        mutation.validate()?;
        Ok(mutation)
    }

    /// Checks that need no store state.
    fn validate(&self) -> Result<()> {
        fn non_empty(field: &str, value: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(SyncError::Validation(format!("{field} must not be empty")));
            }
            Ok(())
        }

        match self {
            Self::ObjectCreate(p) => {
                non_empty("name", &p.name)?;
                non_empty("type", &p.object_type)
            }
            Self::ObjectUpdate(p) => {
                non_empty("name", &p.name)?;
                if p.fields.is_empty() {
                    return Err(SyncError::Validation("object_update changes nothing".into()));
                }
                Ok(())
            }
            Self::ObjectDelete(p) => non_empty("name", &p.name),
            Self::EntityCreate(p) => non_empty("entity.id", &p.entity.id),
            Self::EntityUpdate(p) => non_empty("entity_id", &p.entity_id),
            Self::EntityDelete(p) => match (&p.entity_id, &p.tag) {
                (Some(_), None) | (None, Some(_)) => Ok(()),
                _ => Err(SyncError::Validation(
                    "entity_delete needs exactly one of entity_id or tag".into(),
                )),
            },
            Self::AvatarRegister(p) => non_empty("participant", &p.participant),
            Self::AvatarMove(p) => {
                non_empty("participant", &p.participant)?;
                if p.position.is_none() && p.rotation.is_none() && p.animation.is_none() {
                    return Err(SyncError::Validation("avatar_move changes nothing".into()));
                }
                Ok(())
            }
            Self::AvatarRemove(p) => non_empty("participant", &p.participant),
            _ => Ok(()),
        }
    }

    pub fn op_type(&self) -> OperationType {
        match self {
            Self::SessionCreate(_) => OperationType::SessionCreate,
            Self::SessionDelete(_) => OperationType::SessionDelete,
            Self::ObjectCreate(_) => OperationType::ObjectCreate,
            Self::ObjectUpdate(_) => OperationType::ObjectUpdate,
            Self::ObjectDelete(_) => OperationType::ObjectDelete,
            Self::EntityCreate(_) => OperationType::EntityCreate,
            Self::EntityUpdate(_) => OperationType::EntityUpdate,
            Self::EntityDelete(_) => OperationType::EntityDelete,
            Self::AvatarRegister(_) => OperationType::AvatarRegister,
            Self::AvatarMove(_) => OperationType::AvatarMove,
            Self::AvatarRemove(_) => OperationType::AvatarRemove,
            Self::AvatarClear(_) => OperationType::AvatarClear,
            Self::WorldInit(_) => OperationType::WorldInit,
            Self::SceneUpdate(_) => OperationType::SceneUpdate,
        }
    }

    /// Session the mutation targets (or creates/deletes).
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::SessionCreate(p) => p.session_id,
            Self::SessionDelete(p) | Self::AvatarClear(p) => p.session_id,
            Self::ObjectCreate(p) => p.session_id,
            Self::ObjectUpdate(p) => p.session_id,
            Self::ObjectDelete(p) => p.session_id,
            Self::EntityCreate(p) => p.session_id,
            Self::EntityUpdate(p) => p.session_id,
            Self::EntityDelete(p) => p.session_id,
            Self::AvatarRegister(p) => p.session_id,
            Self::AvatarMove(p) => p.session_id,
            Self::AvatarRemove(p) => p.session_id,
            Self::WorldInit(p) => p.session_id,
            Self::SceneUpdate(p) => p.session_id,
        }
    }

    pub fn scope(&self) -> Scope {
        if self.op_type().is_global() {
            Scope::Global
        } else {
            Scope::Session(self.session_id())
        }
    }

    /// Re-encode as the untyped payload stored in the log.
    pub fn to_data(&self) -> Result<Map<String, Value>> {
        let value = match self {
            Self::SessionCreate(p) => serde_json::to_value(p)?,
            Self::SessionDelete(p) | Self::AvatarClear(p) => serde_json::to_value(p)?,
            Self::ObjectCreate(p) => serde_json::to_value(p)?,
            Self::ObjectUpdate(p) => serde_json::to_value(p)?,
            Self::ObjectDelete(p) => serde_json::to_value(p)?,
            Self::EntityCreate(p) => serde_json::to_value(p)?,
            Self::EntityUpdate(p) => serde_json::to_value(p)?,
            Self::EntityDelete(p) => serde_json::to_value(p)?,
            Self::AvatarRegister(p) => serde_json::to_value(p)?,
            Self::AvatarMove(p) => serde_json::to_value(p)?,
            Self::AvatarRemove(p) => serde_json::to_value(p)?,
            Self::WorldInit(p) => serde_json::to_value(p)?,
            Self::SceneUpdate(p) => serde_json::to_value(p)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            other => Err(SyncError::Validation(format!("payload is not a map: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    #[test]
    fn test_type_tags_match_serde() {
        for t in OperationType::ALL {
            let encoded = serde_json::to_value(t).unwrap();
            assert_eq!(encoded, Value::String(t.as_str().to_string()));
            assert_eq!(t.as_str().parse::<OperationType>().unwrap(), t);
        }
    }

    #[test]
    fn test_type_indices_are_dense() {
        for (i, t) in OperationType::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = "teleport".parse::<OperationType>().unwrap_err();
        assert_eq!(err, SyncError::UnknownOperationType("teleport".into()));
    }

    #[test]
    fn test_decode_object_create() {
        let session = Uuid::new_v4();
        let payload = data(json!({
            "session_id": session,
            "name": "beacon",
            "type": "sphere",
            "x": 0.0, "y": 2.0, "z": 0.0
        }));
        match Mutation::decode(OperationType::ObjectCreate, &payload).unwrap() {
            Mutation::ObjectCreate(p) => {
                assert_eq!(p.session_id, session);
                assert_eq!(p.name, "beacon");
                assert_eq!(p.object_type, "sphere");
                assert_eq!(p.y, 2.0);
            }
            other => panic!("unexpected mutation {other:?}"),
        }
    }

    #[test]
    fn test_missing_field_is_validation_error() {
        let payload = data(json!({ "session_id": Uuid::new_v4(), "name": "beacon" }));
        let err = Mutation::decode(OperationType::ObjectCreate, &payload).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_object_update_flattened_fields() {
        let payload = data(json!({ "session_id": Uuid::new_v4(), "name": "beacon", "y": 5.0 }));
        match Mutation::decode(OperationType::ObjectUpdate, &payload).unwrap() {
            Mutation::ObjectUpdate(p) => {
                assert_eq!(p.fields.y, Some(5.0));
                assert_eq!(p.fields.x, None);
                assert_eq!(p.fields.object_type, None);
            }
            other => panic!("unexpected mutation {other:?}"),
        }
    }

    #[test]
    fn test_empty_object_update_rejected() {
        let payload = data(json!({ "session_id": Uuid::new_v4(), "name": "beacon" }));
        assert!(Mutation::decode(OperationType::ObjectUpdate, &payload).is_err());
    }

    #[test]
    fn test_entity_delete_needs_exactly_one_selector() {
        let session = Uuid::new_v4();
        let both = data(json!({ "session_id": session, "entity_id": "e1", "tag": "avatar" }));
        let neither = data(json!({ "session_id": session }));
        let by_tag = data(json!({ "session_id": session, "tag": "avatar" }));
        assert!(Mutation::decode(OperationType::EntityDelete, &both).is_err());
        assert!(Mutation::decode(OperationType::EntityDelete, &neither).is_err());
        assert!(Mutation::decode(OperationType::EntityDelete, &by_tag).is_ok());
    }

    #[test]
    fn test_entity_spec_defaults() {
        let payload = data(json!({ "session_id": Uuid::new_v4(), "entity": { "id": "lamp" } }));
        match Mutation::decode(OperationType::EntityCreate, &payload).unwrap() {
            Mutation::EntityCreate(p) => {
                assert!(p.entity.enabled);
                assert!(p.entity.components.is_empty());
                assert!(p.entity.tags.is_empty());
                assert!(p.replace_tag.is_none());
            }
            other => panic!("unexpected mutation {other:?}"),
        }
    }

    #[test]
    fn test_scope() {
        let session = Uuid::new_v4();
        let create = Mutation::SessionCreate(SessionCreate { session_id: session, world_id: None });
        let clear = Mutation::AvatarClear(SessionTarget { session_id: session });
        assert_eq!(create.scope(), Scope::Global);
        assert_eq!(clear.scope(), Scope::Session(session));

        let op = Operation::new("c1", OperationType::AvatarClear, clear.to_data().unwrap());
        assert_eq!(op.scope(), Scope::Session(session));
        let op = Operation::new("c1", OperationType::SessionCreate, create.to_data().unwrap());
        assert_eq!(op.scope(), Scope::Global);
    }

    #[test]
    fn test_to_data_decodes_back() {
        let mutation = Mutation::AvatarMove(AvatarMove {
            session_id: Uuid::new_v4(),
            participant: "alice".into(),
            origin: Some("relay".into()),
            counter: Some(3),
            position: Some(Vec3::new(1.0, 0.0, -1.0)),
            rotation: None,
            animation: Some("walk".into()),
            timestamp: None,
        });
        let payload = mutation.to_data().unwrap();
        assert!(!payload.contains_key("rotation"));
        assert_eq!(Mutation::decode(OperationType::AvatarMove, &payload).unwrap(), mutation);
    }

    #[test]
    fn test_operation_wire_shape() {
        let op = Operation::new("c1", OperationType::SceneUpdate, Map::new()).with_sequence(7);
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["type"], "scene_update");
        assert_eq!(value["client_id"], "c1");
        assert!(op.is_sequenced());
    }
}
