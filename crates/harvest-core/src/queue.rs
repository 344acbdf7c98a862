//! Finite queue of unit-of-work identifiers.
//!
//! The pending set is materialized once at startup as the requested range
//! minus everything already completed according to the successful ledger
//! (and, for the page stage, the page files already on disk). Workers pull
//! units in natural order; completion order is whatever the origin allows.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    pending: Mutex<VecDeque<String>>,
    /// Successful-ids cache, shared with workers so duplicate enqueues from
    /// two concurrent starters are skipped rather than re-fetched.
    completed: Mutex<HashSet<String>>,
}

impl WorkQueue {
    /// Build the queue from the requested units minus the completed set.
    /// Requested order is preserved; duplicates are dropped.
    pub fn new(
        requested: impl IntoIterator<Item = String>,
        completed: HashSet<String>,
    ) -> Self {
        let mut seen = HashSet::new();
        let pending: VecDeque<String> = requested
            .into_iter()
            .filter(|id| !completed.contains(id) && seen.insert(id.clone()))
            .collect();

        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(pending),
                completed: Mutex::new(completed),
            }),
        }
    }

    /// Pop the next pending unit, skipping anything completed since enqueue.
    pub fn next(&self) -> Option<String> {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|p| p.into_inner());
        let completed = self
            .inner
            .completed
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        while let Some(id) = pending.pop_front() {
            if !completed.contains(&id) {
                return Some(id);
            }
        }
        None
    }

    pub fn mark_done(&self, id: &str) {
        self.inner
            .completed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string());
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.inner
            .completed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(id)
    }

    pub fn remaining(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}
