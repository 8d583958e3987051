//! In-memory recorder for evicted segments.
//!
//! [`EvictionLog`] is an append-only store: each delivered segment receives a
//! unique, monotonically increasing id. Clones share the same storage, so a
//! caller can hand one clone to the cache and keep another for reading.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::kv_cache::api::{EvictedSegment, EvictionSink};

/// A recorded segment together with its assigned id.
#[derive(Debug, Clone)]
pub struct EvictionRecord {
    pub id: u64,
    pub segment: EvictedSegment,
}

#[derive(Debug, Default)]
struct LogInner {
    next_id: u64,
    records: Vec<EvictionRecord>,
}

/// Shared, append-only log of evicted segments.
#[derive(Debug, Clone, Default)]
pub struct EvictionLog {
    inner: Arc<Mutex<LogInner>>,
}

impl EvictionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        // Records are only ever appended, so a poisoned lock still guards valid data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a segment and return its id.
    pub fn push(&self, segment: EvictedSegment) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.records.push(EvictionRecord { id, segment });
        id
    }

    /// All records in arrival order.
    pub fn records(&self) -> Vec<EvictionRecord> {
        self.lock().records.clone()
    }

    /// Up to `limit` most recent records, newest first.
    pub fn latest(&self, limit: usize) -> Vec<EvictionRecord> {
        self.lock().records.iter().rev().take(limit).cloned().collect()
    }

    pub fn get(&self, id: u64) -> Option<EvictionRecord> {
        let inner = self.lock();
        // Ids are dense and increasing, but `clear` may have dropped a prefix.
        inner
            .records
            .binary_search_by_key(&id, |r| r.id)
            .ok()
            .map(|idx| inner.records[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Total evicted entries recorded for `layer`.
    pub fn tokens_for_layer(&self, layer: usize) -> usize {
        self.lock()
            .records
            .iter()
            .filter(|r| r.segment.layer == layer)
            .map(|r| r.segment.token_count())
            .sum()
    }

    /// Drop stored records. Ids keep increasing afterwards.
    pub fn clear(&self) {
        self.lock().records.clear();
    }
}

impl EvictionSink for EvictionLog {
    fn on_evict(&mut self, segment: &EvictedSegment) {
        self.push(segment.clone());
    }
}
