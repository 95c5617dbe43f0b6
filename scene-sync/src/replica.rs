//! Client-side mirror of the scene, rebuilt purely from sequenced operations.
//!
//! A replica applies operations strictly in sequence order. Anything that
//! arrives early is buffered until the gap before it is filled, either by
//! later live events or by a missing-range request for
//! [`Replica::missing_range`]. Anything at or below `last_applied` is a
//! duplicate and ignored.
//!
//! The buffer is bounded. Once full, the operation furthest from
//! `last_applied` is dropped and reported as [`Ingest::Dropped`]; it lies
//! beyond the gap, so a later catch-up to the server head fetches it again.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;
use crate::oplog::FullSync;
use crate::operation::Operation;
use crate::spatial::Bounds;
use crate::store::SceneStore;

/// Default bound on operations held back behind a gap.
pub const DEFAULT_MAX_PENDING: usize = 4096;

/// What [`Replica::ingest`] did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Applied, together with this many buffered successors.
    Applied { drained: usize },
    /// Ahead of the next expected sequence; held back.
    Buffered,
    /// Already applied.
    Duplicate,
    /// The buffer was full and an operation ahead of the gap was discarded.
    /// The replica needs a catch-up to the server head.
    Dropped,
}

pub struct Replica {
    store: SceneStore,
    last_applied: u64,
    pending: BTreeMap<u64, Operation>,
    max_pending: usize,
}

impl Replica {
    /// `bounds` must match the server's coordinate bound.
    pub fn new(bounds: Bounds) -> Self {
        Self {
            store: SceneStore::new(bounds, Duration::from_secs(2)),
            last_applied: 0,
            pending: BTreeMap::new(),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Bound the out-of-order buffer to `max_pending` operations (at least one).
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn store(&self) -> &SceneStore {
        &self.store
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discard local state and rebuild from a full sync.
    ///
    /// Buffered operations newer than the snapshot are kept and applied.
    pub async fn bootstrap(&mut self, full: &FullSync) -> Result<usize> {
        self.store.clear().await?;
        self.last_applied = 0;
        let applied = self.store.replay(&full.operations).await?;
        self.last_applied = full.current_sequence;
        let head = self.last_applied;
        self.pending.retain(|seq, _| *seq > head);
        self.drain().await?;
        log::debug!("replica bootstrapped to #{} ({applied} operations)", self.last_applied);
        Ok(applied)
    }

    /// Accept one sequenced operation, live or from a catch-up response.
    ///
    /// If applying fails the replica has diverged from the server and should
    /// be bootstrapped again; `last_applied` is left unchanged.
    pub async fn ingest(&mut self, op: Operation) -> Result<Ingest> {
        if op.sequence <= self.last_applied {
            return Ok(Ingest::Duplicate);
        }
        if op.sequence > self.last_applied + 1 {
            return Ok(self.buffer(op));
        }
        self.store.apply(&op).await?;
        self.last_applied = op.sequence;
        let drained = self.drain().await?;
        Ok(Ingest::Applied { drained })
    }

    /// Apply a batch in any order.
    pub async fn ingest_all(&mut self, ops: impl IntoIterator<Item = Operation>) -> Result<()> {
        for op in ops {
            self.ingest(op).await?;
        }
        Ok(())
    }

    /// Inclusive range still needed before buffered operations can apply.
    pub fn missing_range(&self) -> Option<(u64, u64)> {
        let (&first, _) = self.pending.first_key_value()?;
        (first > self.last_applied + 1).then(|| (self.last_applied + 1, first - 1))
    }

    fn buffer(&mut self, op: Operation) -> Ingest {
        if self.pending.contains_key(&op.sequence) || self.pending.len() < self.max_pending {
            self.pending.insert(op.sequence, op);
            return Ingest::Buffered;
        }
        // Full: keep whichever operations sit closest to the gap.
        let furthest = self.pending.last_key_value().map(|(seq, _)| *seq);
        match furthest {
            Some(furthest) if op.sequence < furthest => {
                self.pending.remove(&furthest);
                log::debug!("replica buffer full, dropped #{furthest} for #{}", op.sequence);
                self.pending.insert(op.sequence, op);
            }
            _ => log::debug!("replica buffer full, dropped #{}", op.sequence),
        }
        Ingest::Dropped
    }

    async fn drain(&mut self) -> Result<usize> {
        let mut drained = 0;
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.last_applied + 1 {
                break;
            }
            let op = entry.remove();
            self.store.apply(&op).await?;
            self.last_applied = op.sequence;
            drained += 1;
        }
        Ok(drained)
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new(Bounds::default())
    }
}
