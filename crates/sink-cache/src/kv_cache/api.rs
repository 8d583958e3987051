//! Public traits describing bounded key/value cache behaviour.

use std::ops::Range;

use candle_core::Tensor;

use crate::core::{CacheWarning, Result};

/// Cache that enforces a hard ceiling on retained sequence length while keeping
/// a permanent sink prefix and the most recent window.
///
/// Every operation slices all layers identically; a call either commits for
/// every layer or leaves the cache untouched.
pub trait BoundedKeyValueCache {
    /// Append new keys and values for `layer`, returning the concatenated
    /// `(keys, values)` now held for that layer.
    fn append(&mut self, layer: usize, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Retained sequence length, validated to agree across layers.
    fn seq_len(&self) -> Result<usize>;

    /// Keep `[0, start_size)` plus the last `recent_size` entries when the cache
    /// exceeds `cache_size`; otherwise a no-op.
    fn trim(&mut self) -> Result<EvictionOutcome>;

    /// Drop the oldest window entries so `num_coming` new tokens fit.
    fn evict_for_space(&mut self, num_coming: usize) -> Result<EvictionOutcome>;

    /// Remove the logical range `[begin, end)` from every layer.
    fn evict_range(&mut self, begin: usize, end: usize) -> Result<EvictionOutcome>;
}

/// Result of a successful trim/evict call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictionOutcome {
    /// Entries removed from each layer.
    pub removed: usize,
    /// Sequence length after the call.
    pub retained: usize,
    pub warning: Option<CacheWarning>,
}

impl EvictionOutcome {
    pub(crate) fn unchanged(len: usize) -> Self {
        Self {
            removed: 0,
            retained: len,
            warning: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.removed == 0
    }
}

/// Which operation discarded a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    Trim,
    MakeSpace,
    Range,
}

/// Key/value slices discarded from one layer by a committed eviction.
#[derive(Debug, Clone)]
pub struct EvictedSegment {
    pub layer: usize,
    /// Logical range the slices occupied in the cache just before removal.
    pub range: Range<usize>,
    pub reason: EvictionReason,
    pub key: Tensor,
    pub value: Tensor,
}

impl EvictedSegment {
    pub fn token_count(&self) -> usize {
        self.range.len()
    }
}

/// Receiver for evicted content.
///
/// Called once per layer, in layer order, after an eviction has been committed.
pub trait EvictionSink: Send {
    fn on_evict(&mut self, segment: &EvictedSegment);
}

impl<F> EvictionSink for F
where
    F: FnMut(&EvictedSegment) + Send,
{
    fn on_evict(&mut self, segment: &EvictedSegment) {
        self(segment)
    }
}

/// Counters describing eviction activity over the cache's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    /// Trims that removed at least one entry.
    pub trims: usize,
    pub space_evictions: usize,
    pub range_evictions: usize,
    /// Entries removed per layer, summed over all evictions.
    pub tokens_evicted: usize,
    pub capacity_warnings: usize,
}
