//! General-purpose scene entities.
//!
//! Component maps are opaque: the store keeps and returns whatever JSON the
//! client sent and never looks inside, so new component kinds need no store
//! changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::operation::{EntityPatch, EntitySpec};

/// Tag marking the entity that represents a participant's avatar.
pub const AVATAR_TAG: &str = "avatar";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub components: Map<String, Value>,
    pub tags: BTreeSet<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn from_spec(spec: &EntitySpec, created_at: DateTime<Utc>) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            components: spec.components.clone(),
            tags: spec.tags.clone(),
            enabled: spec.enabled,
            created_at,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn component(&self, name: &str) -> Option<&Value> {
        self.components.get(name)
    }

    pub(crate) fn apply_patch(&mut self, patch: &EntityPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(components) = &patch.components {
            for (key, value) in components {
                if value.is_null() {
                    self.components.remove(key);
                } else {
                    self.components.insert(key.clone(), value.clone());
                }
            }
        }
        if let Some(tags) = &patch.tags {
            self.tags = tags.clone();
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
    }
}
