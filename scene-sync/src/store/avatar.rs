//! Avatar presence records and version-vector reconciliation.
//!
//! Avatar moves can reach the store along more than one path (the HTTP
//! layer, a relay), so a delayed update may arrive after a newer one. Each
//! avatar field carries its own [`FieldClock`]; an incoming value replaces
//! the stored one only when [`merge_field`] says so.
//!
//! Decision table for an update from `origin` with counter `c`, against a
//! stored counter `s` for that same origin:
//!
//! | condition                        | decision                        |
//! |----------------------------------|---------------------------------|
//! | `c < s`                          | `Keep` (stale)                  |
//! | `c > s`                          | `Replace`                       |
//! | `c == s`, field never stamped    | `Replace`                       |
//! | `c == s`, identical stamp        | `Keep` (duplicate delivery)     |
//! | `c == s`, different stamp        | `Conflict`, larger stamp wins   |
//!
//! Stamps order by timestamp, then by origin identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::spatial::Vec3;

/// Per-origin counters: `participant -> counter`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `origin`, 0 if never seen.
    pub fn get(&self, origin: &str) -> u64 {
        self.0.get(origin).copied().unwrap_or(0)
    }

    /// Raise the counter for `origin` to at least `counter`.
    pub fn observe(&mut self, origin: &str, counter: u64) {
        let entry = self.0.entry(origin.to_string()).or_insert(0);
        *entry = (*entry).max(counter);
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &VersionVector) {
        for (origin, counter) in &other.0 {
            self.observe(origin, *counter);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Total order used to break ties between equal counters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub timestamp: DateTime<Utc>,
    pub origin: String,
}

/// Version state of one avatar field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldClock {
    pub vector: VersionVector,
    /// Stamp of the update that produced the current value.
    pub stamp: Option<Stamp>,
}

impl FieldClock {
    fn accept(&mut self, incoming: &FieldVersion) {
        self.vector.observe(&incoming.origin, incoming.counter);
        self.stamp = Some(incoming.stamp());
    }
}

/// Version information carried by an incoming field update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldVersion {
    pub origin: String,
    pub counter: u64,
    pub timestamp: DateTime<Utc>,
}

impl FieldVersion {
    pub fn stamp(&self) -> Stamp {
        Stamp {
            timestamp: self.timestamp,
            origin: self.origin.clone(),
        }
    }
}

/// Outcome of comparing an incoming field update with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecision {
    Keep,
    Replace,
    /// Same counter, different stamp; resolved by stamp order.
    Conflict { incoming_wins: bool },
}

impl MergeDecision {
    pub fn applies(self) -> bool {
        matches!(self, Self::Replace | Self::Conflict { incoming_wins: true })
    }
}

/// Compare an incoming field version against the stored field clock.
pub fn merge_field(incoming: &FieldVersion, stored: &FieldClock) -> MergeDecision {
    let stored_counter = stored.vector.get(&incoming.origin);
    if incoming.counter < stored_counter {
        return MergeDecision::Keep;
    }
    if incoming.counter > stored_counter {
        return MergeDecision::Replace;
    }
    match &stored.stamp {
        None => MergeDecision::Replace,
        Some(current) => {
            let stamp = incoming.stamp();
            if stamp == *current {
                MergeDecision::Keep
            } else {
                MergeDecision::Conflict {
                    incoming_wins: stamp > *current,
                }
            }
        }
    }
}

/// Version clocks for each mergeable avatar field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvatarVersions {
    pub position: FieldClock,
    pub rotation: FieldClock,
    pub animation: FieldClock,
}

impl AvatarVersions {
    /// Version vector across all fields (pointwise max).
    pub fn combined(&self) -> VersionVector {
        let mut vector = self.position.vector.clone();
        vector.merge(&self.rotation.vector);
        vector.merge(&self.animation.vector);
        vector
    }
}

/// A participant's live presence inside one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarState {
    pub participant: String,
    pub position: Vec3,
    pub rotation: Vec3,
    pub animation: String,
    pub updated_at: DateTime<Utc>,
    pub versions: AvatarVersions,
}

/// Resolved avatar update: version info plus the fields it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarUpdate {
    pub version: FieldVersion,
    pub position: Option<Vec3>,
    pub rotation: Option<Vec3>,
    pub animation: Option<String>,
}

/// Per-field result of [`AvatarState::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveOutcome {
    pub position: Option<MergeDecision>,
    pub rotation: Option<MergeDecision>,
    pub animation: Option<MergeDecision>,
}

impl MoveOutcome {
    pub fn changed(&self) -> bool {
        [self.position, self.rotation, self.animation]
            .into_iter()
            .flatten()
            .any(MergeDecision::applies)
    }
}

impl AvatarState {
    pub fn new(participant: impl Into<String>, registered_at: DateTime<Utc>) -> Self {
        Self {
            participant: participant.into(),
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            animation: String::new(),
            updated_at: registered_at,
            versions: AvatarVersions::default(),
        }
    }

    /// Highest counter this avatar has seen from `origin` on any field.
    pub fn counter_for(&self, origin: &str) -> u64 {
        self.versions.combined().get(origin)
    }

    /// Merge an update field by field. Fields the update omits are untouched.
    pub fn merge(&mut self, update: &AvatarUpdate) -> MoveOutcome {
        let version = &update.version;
        let mut outcome = MoveOutcome {
            position: None,
            rotation: None,
            animation: None,
        };

        if let Some(position) = update.position {
            let decision = merge_field(version, &self.versions.position);
            if decision.applies() {
                self.position = position;
                self.versions.position.accept(version);
            }
            outcome.position = Some(decision);
        }

        if let Some(rotation) = update.rotation {
            let decision = merge_field(version, &self.versions.rotation);
            if decision.applies() {
                self.rotation = rotation;
                self.versions.rotation.accept(version);
            }
            outcome.rotation = Some(decision);
        }

        if let Some(animation) = &update.animation {
            let decision = merge_field(version, &self.versions.animation);
            if decision.applies() {
                self.animation = animation.clone();
                self.versions.animation.accept(version);
            }
            outcome.animation = Some(decision);
        }

        if outcome.changed() && version.timestamp > self.updated_at {
            self.updated_at = version.timestamp;
        }
        outcome
    }
}
