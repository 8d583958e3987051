//! Logical positions for rotary encoding over a bounded cache.
//!
//! Positions are derived from the cache's current contents only: a key's
//! position is its rank in the cache, and query positions saturate at
//! `cache_size - 1`. Nothing here counts how many tokens the stream has seen,
//! so every angle stays inside the range `[0, cache_size)`.

use candle_core::{Device, Tensor};

use crate::core::{CacheError, Result, StreamingConfig};

/// Zone a cached slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheZone {
    Sink,
    Window,
}

/// Rank-based position of one slot in the pre-step cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalPosition {
    pub index: u32,
    pub zone: CacheZone,
}

/// Positions assigned to one attention step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPositions {
    /// `0..kv_len`, one per key in arrival order.
    pub keys: Vec<u32>,
    /// One per new query token, capped at `cache_size - 1`.
    pub queries: Vec<u32>,
    /// Rows the rotary table must cover for this step.
    pub table_len: usize,
}

impl StepPositions {
    pub fn kv_len(&self) -> usize {
        self.keys.len()
    }

    pub fn num_new(&self) -> usize {
        self.queries.len()
    }

    pub fn key_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_vec(self.keys.clone(), self.keys.len(), device)
    }

    pub fn query_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_vec(self.queries.clone(), self.queries.len(), device)
    }
}

/// Stateless mapping from cache shape to rotary positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRemapper {
    start_size: usize,
    cache_size: usize,
}

impl PositionRemapper {
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            start_size: config.start_size,
            cache_size: config.cache_size(),
        }
    }

    pub fn start_size(&self) -> usize {
        self.start_size
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    /// Assign positions for a step whose concatenated key sequence holds
    /// `kv_len` entries, the last `num_new` of which belong to this step.
    pub fn remap(&self, kv_len: usize, num_new: usize) -> Result<StepPositions> {
        if num_new == 0 {
            return Err(CacheError::InvalidStep(
                "a step must carry at least one new token".into(),
            ));
        }
        if num_new > kv_len {
            return Err(CacheError::InvalidStep(format!(
                "{num_new} new tokens exceed key sequence length {kv_len}"
            )));
        }
        if kv_len > u32::MAX as usize {
            return Err(CacheError::InvalidStep(format!(
                "key sequence length {kv_len} does not fit a u32 position"
            )));
        }

        let cap = self.cache_size.saturating_sub(1);
        let first_query = kv_len - num_new;
        let keys = (0..kv_len as u32).collect();
        let queries = (0..num_new)
            .map(|i| (first_query + i).min(cap) as u32)
            .collect();
        Ok(StepPositions {
            keys,
            queries,
            table_len: kv_len,
        })
    }

    /// Logical position of every slot in a cache currently holding `len` entries.
    pub fn cached_positions(&self, len: usize) -> impl Iterator<Item = LogicalPosition> + '_ {
        (0..len).map(move |slot| LogicalPosition {
            index: slot as u32,
            zone: if slot < self.start_size {
                CacheZone::Sink
            } else {
                CacheZone::Window
            },
        })
    }
}
