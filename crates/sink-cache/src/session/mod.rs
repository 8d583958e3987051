//! Per-step driver tying the cache, the remapper and the rotary provider together.
//!
//! A step always runs in the same order:
//!
//! 1. [`StreamingSession::begin_step`] makes room for the incoming tokens.
//! 2. [`StreamingSession::attend`] is called once per layer. It appends the raw
//!    keys/values, assigns positions, and returns rotated tensors for the
//!    attention kernel.
//! 3. [`StreamingSession::end_step`] checks that every layer advanced and trims
//!    the cache back under `cache_size`.
//!
//! Calls made out of this order are rejected with [`CacheError::InvalidStep`].
//! A failed `attend` commits nothing and may be retried;
//! [`StreamingSession::abort_step`] abandons the step instead.

use candle_core::Tensor;

use crate::core::{CacheError, CacheWarning, Result};
use crate::interop::{rotate_along, RotaryTableProvider};
use crate::kv_cache::{BoundedKeyValueCache, CacheState, EvictionOutcome, LayerCacheEntry};
use crate::positions::{PositionRemapper, StepPositions};

/// Tensors handed to the external attention kernel for one layer.
#[derive(Debug, Clone)]
pub struct AttentionInputs {
    /// New queries rotated at their capped positions.
    pub query: Tensor,
    /// Every cached key, rotated at dense positions `0..kv_len`.
    pub key: Tensor,
    /// Every cached value; values carry no positional rotation.
    pub value: Tensor,
    pub positions: StepPositions,
}

#[derive(Debug, Clone)]
enum StepState {
    Idle,
    Active {
        num_new: usize,
        attended: Vec<bool>,
        /// Layers as they stood after `begin_step`'s eviction.
        before: Vec<Option<LayerCacheEntry>>,
    },
}

/// Outcome of a finished step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    /// Eviction performed by `begin_step`.
    pub make_space: EvictionOutcome,
    /// Trim performed by `end_step`.
    pub trim: EvictionOutcome,
    /// Sequence length once the step committed.
    pub seq_len: usize,
}

impl StepReport {
    pub fn warnings(&self) -> impl Iterator<Item = CacheWarning> {
        self.make_space.warning.into_iter().chain(self.trim.warning)
    }
}

/// Streaming driver over one [`CacheState`].
#[derive(Debug)]
pub struct StreamingSession<P> {
    cache: CacheState,
    remapper: PositionRemapper,
    provider: P,
    state: StepState,
    make_space: EvictionOutcome,
}

impl<P: RotaryTableProvider> StreamingSession<P> {
    pub fn new(cache: CacheState, provider: P) -> Self {
        let remapper = PositionRemapper::new(cache.config());
        Self {
            cache,
            remapper,
            provider,
            state: StepState::Idle,
            make_space: EvictionOutcome::default(),
        }
    }

    pub fn cache(&self) -> &CacheState {
        &self.cache
    }

    /// Mutable access between steps, e.g. for `evict_range` or `set_start_size`.
    pub fn cache_mut(&mut self) -> Result<&mut CacheState> {
        self.ensure_idle("cache_mut")?;
        Ok(&mut self.cache)
    }

    pub fn remapper(&self) -> &PositionRemapper {
        &self.remapper
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn in_step(&self) -> bool {
        matches!(self.state, StepState::Active { .. })
    }

    pub fn into_cache(self) -> CacheState {
        self.cache
    }

    /// Open a step that will append `num_new` tokens to every layer.
    pub fn begin_step(&mut self, num_new: usize) -> Result<EvictionOutcome> {
        self.ensure_idle("begin_step")?;
        if num_new == 0 {
            return Err(CacheError::InvalidStep(
                "a step must carry at least one new token".into(),
            ));
        }
        // start_size may have been re-declared between steps.
        self.remapper = PositionRemapper::new(self.cache.config());
        let outcome = self.cache.evict_for_space(num_new)?;
        self.make_space = outcome;
        self.state = StepState::Active {
            num_new,
            attended: vec![false; self.cache.num_layers()],
            before: self.cache.snapshot(),
        };
        Ok(outcome)
    }

    /// Abandon the current step, dropping every key/value appended during it.
    ///
    /// The eviction done by `begin_step` stays committed.
    pub fn abort_step(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, StepState::Idle) {
            StepState::Idle => Err(CacheError::InvalidStep(
                "abort_step without begin_step".into(),
            )),
            StepState::Active { attended, before, .. } => {
                let appended = attended.iter().filter(|done| **done).count();
                log::debug!("sink-cache step aborted: rolled back {appended} layers");
                self.cache.restore(before);
                self.make_space = EvictionOutcome::default();
                Ok(())
            }
        }
    }

    /// Append this step's raw keys/values for `layer` and rotate for attention.
    ///
    /// `query` and `value` share the value layout; `key` follows the key layout.
    pub fn attend(
        &mut self,
        layer: usize,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<AttentionInputs> {
        let num_new = match &self.state {
            StepState::Idle => {
                return Err(CacheError::InvalidStep(format!(
                    "attend on layer {layer} outside a step"
                )))
            }
            StepState::Active {
                num_new, attended, ..
            } => {
                let layers = attended.len();
                match attended.get(layer) {
                    None => return Err(CacheError::UnknownLayer { layer, layers }),
                    Some(true) => {
                        return Err(CacheError::InvalidStep(format!(
                            "layer {layer} already attended this step"
                        )))
                    }
                    Some(false) => *num_new,
                }
            }
        };

        let layout = self.cache.config().layout;
        let key_len = layout.key_len(key)?;
        let query_len = layout.value_len(query)?;
        if key_len != num_new || query_len != num_new {
            return Err(CacheError::InvalidStep(format!(
                "layer {layer} brought {key_len} keys and {query_len} queries, \
                 step declared {num_new}"
            )));
        }
        let head_dim = query.dims().last().copied().unwrap_or(0);

        let next = self.cache.extended(layer, key, value)?;
        let kv_len = layout.key_len(&next.key)?;
        let positions = self.remapper.remap(kv_len, num_new)?;
        let tables = self.provider.tables(positions.table_len, head_dim)?;
        let query = rotate_along(query, layout.value_seq_dim(), &positions.queries, &tables)?;
        let key = rotate_along(&next.key, layout.key_seq_dim(), &positions.keys, &tables)?;
        let value = next.value.clone();

        self.cache.commit_layer(layer, next);
        if let StepState::Active { attended, .. } = &mut self.state {
            attended[layer] = true;
        }
        Ok(AttentionInputs {
            query,
            key,
            value,
            positions,
        })
    }

    /// Close the step once every layer has attended, trimming to `cache_size`.
    pub fn end_step(&mut self) -> Result<StepReport> {
        let pending: Vec<usize> = match &self.state {
            StepState::Idle => {
                return Err(CacheError::InvalidStep("end_step without begin_step".into()))
            }
            StepState::Active { attended, .. } => attended
                .iter()
                .enumerate()
                .filter(|(_, done)| !**done)
                .map(|(layer, _)| layer)
                .collect(),
        };
        if !pending.is_empty() {
            return Err(CacheError::InvalidStep(format!(
                "layers {pending:?} have not attended this step"
            )));
        }

        self.cache.seq_len()?;
        let trim = self.cache.trim()?;
        self.state = StepState::Idle;
        Ok(StepReport {
            make_space: std::mem::take(&mut self.make_space),
            trim,
            seq_len: trim.retained,
        })
    }

    fn ensure_idle(&self, op: &str) -> Result<()> {
        match self.state {
            StepState::Idle => Ok(()),
            StepState::Active { .. } => Err(CacheError::InvalidStep(format!(
                "{op} called while a step is in progress"
            ))),
        }
    }
}
