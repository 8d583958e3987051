//! Bounded key/value storage for streaming decoding.
//!
//! The cache keeps a fixed sink prefix plus a sliding window of the most recent
//! entries, slices every layer identically, and hands discarded slices to an
//! optional [`EvictionSink`].

pub mod api;
pub mod layout;
pub mod sink;
pub mod store;

pub use api::{
    BoundedKeyValueCache, EvictedSegment, EvictionOutcome, EvictionReason, EvictionSink,
    EvictionStats,
};
pub use layout::LayoutDescriptor;
pub use sink::{EvictionLog, EvictionRecord};
pub use store::{CacheState, LayerCacheEntry};

#[cfg(test)]
mod tests;
