//! Append-only operation log.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               OperationLog                   │
//! │                                              │
//! │  ordering lock ─┬─ sequence += 1             │
//! │                 ├─ entries.push(Arc<op>)     │
//! │                 └─ notify listeners          │
//! │                                              │
//! │  atomics: current sequence, per-type counts  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The ordering lock guards nothing but those three steps. Listeners are
//! unbounded channels, so notifying never blocks and every listener sees
//! operations in sequence order. Stats read only the atomics.
//!
//! Entry `i` holds sequence `i + 1`; sequences start at 1 and have no gaps.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::operation::{Operation, OperationType};

/// Default cap on the span of a missing-range request.
pub const DEFAULT_MAX_MISSING_RANGE: u64 = 10_000;

/// Every operation ever admitted plus the head of the log, read atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSync {
    pub operations: Vec<Operation>,
    pub current_sequence: u64,
}

/// Counters maintained by the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogStats {
    pub total_operations: u64,
    pub current_sequence: u64,
    pub by_type: BTreeMap<OperationType, u64>,
}

struct LogInner {
    entries: Vec<Arc<Operation>>,
    listeners: Vec<mpsc::UnboundedSender<Arc<Operation>>>,
}

pub struct OperationLog {
    inner: RwLock<LogInner>,
    current: AtomicU64,
    counts: [AtomicU64; OperationType::COUNT],
    max_missing_range: u64,
}

impl OperationLog {
    pub fn new(max_missing_range: u64) -> Self {
        Self {
            inner: RwLock::new(LogInner {
                entries: Vec::new(),
                listeners: Vec::new(),
            }),
            current: AtomicU64::new(0),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            max_missing_range,
        }
    }

    /// Register a listener that receives every operation appended from now on.
    pub fn add_listener(&self) -> mpsc::UnboundedReceiver<Arc<Operation>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().listeners.push(tx);
        rx
    }

    /// Assign the next sequence number and append.
    ///
    /// Infallible: by the time an operation reaches the log it has already
    /// been validated and applied.
    pub fn append(&self, op: Operation) -> Arc<Operation> {
        let mut inner = self.inner.write();
        let sequence = inner.entries.len() as u64 + 1;
        let op = Arc::new(op.with_sequence(sequence));
        inner.entries.push(op.clone());

        self.current.store(sequence, Ordering::Release);
        self.counts[op.op_type.index()].fetch_add(1, Ordering::Relaxed);

        inner.listeners.retain(|listener| listener.send(op.clone()).is_ok());
        op
    }

    pub fn current_sequence(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn max_missing_range(&self) -> u64 {
        self.max_missing_range
    }

    /// Operations with sequence in `[from, to]`.
    ///
    /// `to` is clamped to the head and `from = 0` is read as 1. An inverted
    /// range is empty. A clamped span above the configured maximum is
    /// rejected with `RangeTooLarge`.
    pub fn get_missing_operations(&self, from: u64, to: u64) -> Result<Vec<Operation>> {
        let inner = self.inner.read();
        let head = inner.entries.len() as u64;
        let from = from.max(1);
        let to = to.min(head);
        if from > to {
            return Ok(Vec::new());
        }
        if to - from + 1 > self.max_missing_range {
            return Err(SyncError::RangeTooLarge {
                from,
                to,
                max: self.max_missing_range,
            });
        }
        let start = (from - 1) as usize;
        let end = to as usize;
        Ok(inner.entries[start..end].iter().map(|op| (**op).clone()).collect())
    }

    pub fn get_all_operations(&self) -> Vec<Operation> {
        self.full_sync().operations
    }

    pub fn full_sync(&self) -> FullSync {
        let inner = self.inner.read();
        FullSync {
            operations: inner.entries.iter().map(|op| (**op).clone()).collect(),
            current_sequence: inner.entries.len() as u64,
        }
    }

    pub fn count(&self, op_type: OperationType) -> u64 {
        self.counts[op_type.index()].load(Ordering::Relaxed)
    }

    /// Lock-free snapshot of the counters.
    pub fn stats(&self) -> LogStats {
        let mut by_type = BTreeMap::new();
        let mut total = 0;
        for op_type in OperationType::ALL {
            let n = self.count(op_type);
            total += n;
            if n > 0 {
                by_type.insert(op_type, n);
            }
        }
        LogStats {
            total_operations: total,
            current_sequence: self.current_sequence(),
            by_type,
        }
    }
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MISSING_RANGE)
    }
}
