//! Set of write-cache entries already written to the main storage
//!
//! The set is bounded: once it grows past its capacity the oldest entries
//! are handed back to the caller, which drops the cached copy and only then
//! [`forget`](FlushedSet::forget)s them. A flush must
//! [`claim`](FlushedSet::claim) an entry first, so two paths racing for the
//! same entry never both write it.

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Entry dropped from the set: `(key, stored in the keyed database)`
pub type Evicted = (String, bool);

pub struct FlushedSet {
    /// key → entry lives in the keyed database (false: file tree)
    entries: DashMap<String, bool>,
    order: Mutex<VecDeque<String>>,
    in_flight: DashSet<String>,
    capacity: usize,
}

impl FlushedSet {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            in_flight: DashSet::new(),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Take exclusive right to flush `key`.
    ///
    /// Returns `None` when the entry is already flushed or another flush
    /// holds it. Dropping the claim without committing releases it.
    #[must_use]
    pub fn claim(&self, key: &str) -> Option<FlushClaim<'_>> {
        if self.entries.contains_key(key) || !self.in_flight.insert(key.to_string()) {
            return None;
        }

        let claim = FlushClaim {
            set: self,
            key: key.to_string(),
        };
        // a commit may have landed between the check and the insert
        if self.entries.contains_key(key) {
            return None;
        }
        Some(claim)
    }

    /// Forget that `key` was flushed; used once the cached copy is gone or
    /// rewritten
    pub fn forget(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Put an evicted entry back in line after its cached copy could not be
    /// dropped
    pub fn requeue(&self, key: String) {
        self.order.lock().push_back(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&self, key: String, in_db: bool) -> Vec<Evicted> {
        let mut order = self.order.lock();
        self.entries.insert(key.clone(), in_db);
        order.push_back(key);

        let mut evicted = Vec::new();
        while order.len() > self.capacity {
            let Some(old) = order.pop_front() else {
                break;
            };
            // forgotten keys leave stale slots behind
            if let Some(in_db) = self.entries.get(&old).map(|e| *e) {
                evicted.push((old, in_db));
            }
        }
        evicted
    }
}

/// Exclusive right to flush one entry
pub struct FlushClaim<'a> {
    set: &'a FlushedSet,
    key: String,
}

impl FlushClaim<'_> {
    /// Record the entry as flushed; returns entries evicted to make room
    #[must_use]
    pub fn commit(self, in_db: bool) -> Vec<Evicted> {
        self.set.insert(self.key.clone(), in_db)
    }
}

impl Drop for FlushClaim<'_> {
    fn drop(&mut self) {
        self.set.in_flight.remove(&self.key);
    }
}
