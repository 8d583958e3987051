//! Sink + sliding-window key/value store.
//!
//! [`CacheState`] owns one [`LayerCacheEntry`] per attention layer. Entries
//! keep raw (pre-rotary) keys so positions can be reassigned after every
//! eviction. Each slicing operation follows the same pattern: compute the
//! retained tensors for every layer, check that all layers agree, then commit
//! and notify the eviction sink. A failure part-way leaves the cache untouched.

use std::fmt;
use std::ops::Range;

use candle_core::Tensor;

use crate::core::{CacheError, CacheWarning, Result, StreamingConfig};
use crate::kv_cache::api::{
    BoundedKeyValueCache, EvictedSegment, EvictionOutcome, EvictionReason, EvictionSink,
    EvictionStats,
};

/// Cached keys and values of a single attention layer.
#[derive(Debug, Clone)]
pub struct LayerCacheEntry {
    pub key: Tensor,
    pub value: Tensor,
}

/// Bounded per-sequence cache state.
///
/// One instance per generation sequence; it is `Send` but deliberately not
/// `Sync`, so two steps cannot mutate it concurrently.
pub struct CacheState {
    config: StreamingConfig,
    layers: Vec<Option<LayerCacheEntry>>,
    sink: Option<Box<dyn EvictionSink>>,
    stats: EvictionStats,
}

impl fmt::Debug for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheState")
            .field("config", &self.config)
            .field("layers", &self.layers)
            .field("has_sink", &self.sink.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

impl CacheState {
    pub fn new(config: StreamingConfig, num_layers: usize) -> Result<Self> {
        config.validate()?;
        if num_layers == 0 {
            return Err(CacheError::InvalidConfig(
                "num_layers must be greater than zero".into(),
            ));
        }
        log::info!(
            "sink-cache init: start_size={} recent_size={} cache_size={} layout={:?} layers={}",
            config.start_size,
            config.recent_size,
            config.cache_size(),
            config.layout,
            num_layers
        );
        Ok(Self {
            config,
            layers: vec![None; num_layers],
            sink: None,
            stats: EvictionStats::default(),
        })
    }

    pub fn with_eviction_sink(mut self, sink: impl EvictionSink + 'static) -> Self {
        self.set_eviction_sink(sink);
        self
    }

    /// Install the receiver for evicted content, replacing any previous one.
    pub fn set_eviction_sink(&mut self, sink: impl EvictionSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    pub fn clear_eviction_sink(&mut self) -> Option<Box<dyn EvictionSink>> {
        self.sink.take()
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn start_size(&self) -> usize {
        self.config.start_size
    }

    pub fn recent_size(&self) -> usize {
        self.config.recent_size
    }

    pub fn cache_size(&self) -> usize {
        self.config.cache_size()
    }

    /// Re-declare the sink zone after an `evict_range` that touched it.
    ///
    /// The new sink zone must lie within the retained entries. The cache never
    /// adjusts `start_size` on its own.
    pub fn set_start_size(&mut self, start_size: usize) -> Result<()> {
        let next = StreamingConfig {
            start_size,
            ..self.config
        };
        next.validate()?;
        let len = self.checked_len()?;
        if start_size > len {
            return Err(CacheError::InvalidConfig(format!(
                "start_size {start_size} exceeds retained length {len}"
            )));
        }
        log::info!(
            "sink-cache start_size {} -> {}",
            self.config.start_size,
            start_size
        );
        self.config = next;
        Ok(())
    }

    /// Every layer's entry, for restoring an abandoned step.
    pub(crate) fn snapshot(&self) -> Vec<Option<LayerCacheEntry>> {
        self.layers.clone()
    }

    pub(crate) fn restore(&mut self, layers: Vec<Option<LayerCacheEntry>>) {
        debug_assert_eq!(layers.len(), self.layers.len());
        self.layers = layers;
    }

    /// `layer`'s cached entry with `key`/`value` appended, without committing it.
    pub(crate) fn extended(
        &self,
        layer: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<LayerCacheEntry> {
        let layers = self.layers.len();
        if layer >= layers {
            return Err(CacheError::UnknownLayer { layer, layers });
        }
        let incoming = LayerCacheEntry {
            key: key.clone(),
            value: value.clone(),
        };
        if self.entry_len(layer, &incoming)? == 0 {
            return Err(CacheError::InvalidStep(format!(
                "append to layer {layer} carries no tokens"
            )));
        }

        Ok(match &self.layers[layer] {
            None => incoming,
            Some(entry) => LayerCacheEntry {
                key: Tensor::cat(&[&entry.key, key], self.config.key_seq_dim())?,
                value: Tensor::cat(&[&entry.value, value], self.config.value_seq_dim())?,
            },
        })
    }

    /// Store an entry built by [`CacheState::extended`].
    pub(crate) fn commit_layer(&mut self, layer: usize, entry: LayerCacheEntry) {
        self.layers[layer] = Some(entry);
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer: usize) -> Option<&LayerCacheEntry> {
        self.layers.get(layer).and_then(Option::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(Option::is_none)
    }

    /// Drop every cached tensor; configuration, sink and stats are kept.
    pub fn clear(&mut self) {
        for slot in &mut self.layers {
            *slot = None;
        }
    }

    /// Bytes held by cached keys and values.
    pub fn memory_usage(&self) -> usize {
        self.layers
            .iter()
            .flatten()
            .map(|e| {
                e.key.elem_count() * e.key.dtype().size_in_bytes()
                    + e.value.elem_count() * e.value.dtype().size_in_bytes()
            })
            .sum()
    }

    pub fn stats(&self) -> EvictionStats {
        self.stats
    }

    fn entry_len(&self, layer: usize, entry: &LayerCacheEntry) -> Result<usize> {
        let key_len = self.config.layout.key_len(&entry.key)?;
        let value_len = self.config.layout.value_len(&entry.value)?;
        if key_len != value_len {
            return Err(CacheError::ShapeMismatch {
                layer,
                tensor: "value",
                expected: key_len,
                found: value_len,
            });
        }
        Ok(key_len)
    }

    fn checked_len(&self) -> Result<usize> {
        let mut expected = None;
        for (layer, slot) in self.layers.iter().enumerate() {
            let len = match slot {
                Some(entry) => self.entry_len(layer, entry)?,
                None => 0,
            };
            match expected {
                None => expected = Some(len),
                Some(exp) if exp != len => {
                    return Err(CacheError::ShapeMismatch {
                        layer,
                        tensor: "key",
                        expected: exp,
                        found: len,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(expected.unwrap_or(0))
    }

    /// Keep `keep` (in order) on every layer and report `removed` to the sink.
    fn retain(
        &mut self,
        keep: &[Range<usize>],
        removed: &[Range<usize>],
        reason: EvictionReason,
    ) -> Result<()> {
        let expected: usize = keep.iter().map(|r| r.len()).sum();
        let key_dim = self.config.key_seq_dim();
        let value_dim = self.config.value_seq_dim();
        let notify = self.sink.is_some();

        let mut next = Vec::with_capacity(self.layers.len());
        let mut segments = Vec::new();
        for (layer, slot) in self.layers.iter().enumerate() {
            let Some(entry) = slot else {
                next.push(None);
                continue;
            };

            if notify {
                for range in removed.iter().filter(|r| !r.is_empty()) {
                    segments.push(EvictedSegment {
                        layer,
                        range: range.clone(),
                        reason,
                        key: entry.key.narrow(key_dim, range.start, range.len())?,
                        value: entry.value.narrow(value_dim, range.start, range.len())?,
                    });
                }
            }

            if expected == 0 {
                next.push(None);
                continue;
            }
            let kept = LayerCacheEntry {
                key: gather(&entry.key, key_dim, keep)?,
                value: gather(&entry.value, value_dim, keep)?,
            };
            let found = self.entry_len(layer, &kept)?;
            if found != expected {
                return Err(CacheError::ShapeMismatch {
                    layer,
                    tensor: "key",
                    expected,
                    found,
                });
            }
            next.push(Some(kept));
        }

        self.layers = next;
        if let Some(sink) = self.sink.as_mut() {
            for segment in &segments {
                sink.on_evict(segment);
            }
        }
        Ok(())
    }

    fn record(&mut self, reason: EvictionReason, removed: usize, warning: Option<CacheWarning>) {
        match reason {
            EvictionReason::Trim => self.stats.trims += 1,
            EvictionReason::MakeSpace => self.stats.space_evictions += 1,
            EvictionReason::Range => self.stats.range_evictions += 1,
        }
        self.stats.tokens_evicted += removed;
        if let Some(warning) = warning {
            if matches!(warning, CacheWarning::Capacity { .. }) {
                self.stats.capacity_warnings += 1;
            }
            log::warn!("sink-cache: {warning}");
        }
    }
}

/// Concatenate the non-empty `ranges` of `tensor` along `dim` into fresh storage.
fn gather(tensor: &Tensor, dim: usize, ranges: &[Range<usize>]) -> candle_core::Result<Tensor> {
    let parts = ranges
        .iter()
        .filter(|r| !r.is_empty())
        .map(|r| tensor.narrow(dim, r.start, r.len()))
        .collect::<candle_core::Result<Vec<_>>>()?;
    match parts.as_slice() {
        [] => tensor.narrow(dim, 0, 0),
        [single] => single.contiguous(),
        _ => Tensor::cat(&parts, dim),
    }
}

impl BoundedKeyValueCache for CacheState {
    fn append(&mut self, layer: usize, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let next = self.extended(layer, key, value)?;
        let out = (next.key.clone(), next.value.clone());
        self.commit_layer(layer, next);
        Ok(out)
    }

    fn seq_len(&self) -> Result<usize> {
        self.checked_len()
    }

    fn trim(&mut self) -> Result<EvictionOutcome> {
        let len = self.checked_len()?;
        let cache_size = self.cache_size();
        if len <= cache_size {
            return Ok(EvictionOutcome::unchanged(len));
        }

        let start = self.start_size();
        let window_start = len - self.recent_size();
        self.retain(
            &[0..start, window_start..len],
            &[start..window_start],
            EvictionReason::Trim,
        )?;
        let removed = window_start - start;
        self.record(EvictionReason::Trim, removed, None);
        log::debug!("sink-cache trim: removed={removed} len {len} -> {cache_size}");
        Ok(EvictionOutcome {
            removed,
            retained: cache_size,
            warning: None,
        })
    }

    fn evict_for_space(&mut self, num_coming: usize) -> Result<EvictionOutcome> {
        let len = self.checked_len()?;
        let cache_size = self.cache_size();
        if len.saturating_add(num_coming) <= cache_size {
            return Ok(EvictionOutcome::unchanged(len));
        }

        let start = self.start_size();
        let warning = (num_coming > self.recent_size()).then_some(CacheWarning::Capacity {
            requested: num_coming,
            recent_size: self.recent_size(),
        });
        let target = cache_size.saturating_sub(num_coming).max(start);
        if target >= len {
            // Only sink entries remain; nothing left to evict.
            self.record(EvictionReason::MakeSpace, 0, warning);
            return Ok(EvictionOutcome {
                removed: 0,
                retained: len,
                warning,
            });
        }

        let removed = len - target;
        self.retain(
            &[0..start, start + removed..len],
            &[start..start + removed],
            EvictionReason::MakeSpace,
        )?;
        self.record(EvictionReason::MakeSpace, removed, warning);
        log::debug!(
            "sink-cache evict_for_space: num_coming={num_coming} removed={removed} \
             len {len} -> {target}"
        );
        Ok(EvictionOutcome {
            removed,
            retained: target,
            warning,
        })
    }

    fn evict_range(&mut self, begin: usize, end: usize) -> Result<EvictionOutcome> {
        let len = self.checked_len()?;
        if begin >= end || end > len {
            return Err(CacheError::OutOfRange { begin, end, len });
        }

        let start = self.start_size();
        let warning = (begin < start).then_some(CacheWarning::SinkZoneEvicted {
            begin,
            end,
            start_size: start,
        });
        self.retain(&[0..begin, end..len], &[begin..end], EvictionReason::Range)?;
        let removed = end - begin;
        self.record(EvictionReason::Range, removed, warning);
        log::debug!("sink-cache evict_range: [{begin}, {end}) len {len} -> {}", len - removed);
        Ok(EvictionOutcome {
            removed,
            retained: len - removed,
            warning,
        })
    }
}
