//! Bounded key/value cache for streaming attention with attention sinks.
//!
//! The cache keeps the first `start_size` tokens of a sequence forever (the
//! attention sinks) plus a sliding window of the `recent_size` most recent
//! tokens. Keys are stored before any rotary encoding; at every step the
//! [`positions`] module assigns each key its rank in the cache and caps query
//! positions at `cache_size - 1`, so rotary angles never leave the range the
//! cache can hold no matter how long the stream runs.
//!
//! Tensors are `candle_core::Tensor`s of any rank. The sequence axis of keys
//! and values is taken from a [`LayoutDescriptor`], chosen once per model
//! family.
//!
//! [`StreamingSession`] drives the per-step order (make room, append, remap,
//! rotate, trim); [`CacheState`] and [`PositionRemapper`] can also be used
//! directly.

pub mod core;
pub mod interop;
pub mod kv_cache;
pub mod positions;
pub mod session;

pub use crate::core::{CacheError, CacheWarning, ModelFamily, Result, StreamingConfig};
pub use interop::{RopeAdapter, RotaryTableProvider, RotaryTables};
pub use kv_cache::{
    BoundedKeyValueCache, CacheState, EvictedSegment, EvictionLog, EvictionOutcome,
    EvictionReason, EvictionSink, EvictionStats, LayerCacheEntry, LayoutDescriptor,
};
pub use positions::{CacheZone, LogicalPosition, PositionRemapper, StepPositions};
pub use session::{AttentionInputs, StepReport, StreamingSession};
