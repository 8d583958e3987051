//! Error and warning types emitted by the bounded cache.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Failures surfaced by cache, remapping, and session operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A layer (or its key/value pair) disagrees on the retained sequence length.
    #[error("layer {layer} {tensor} has sequence length {found}, expected {expected}")]
    ShapeMismatch {
        layer: usize,
        tensor: &'static str,
        expected: usize,
        found: usize,
    },

    /// `evict_range` bounds are not `0 <= begin < end <= len`.
    #[error("evict range [{begin}, {end}) is invalid for sequence length {len}")]
    OutOfRange { begin: usize, end: usize, len: usize },

    /// Layer index past the configured depth.
    #[error("layer {layer} out of range for {layers} cached layers")]
    UnknownLayer { layer: usize, layers: usize },

    /// A step was driven out of order or with inconsistent token counts.
    #[error("invalid step: {0}")]
    InvalidStep(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported model family: {0}")]
    UnsupportedFamily(String),

    #[error("tensor backend error: {0}")]
    Backend(#[from] candle_core::Error),
}

impl CacheError {
    /// Whether the error signals a broken cross-layer invariant.
    ///
    /// Fatal errors mean any attention computed from this cache would be wrong;
    /// the sequence should be abandoned rather than retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::ShapeMismatch { .. })
    }
}

/// Non-aborting conditions reported alongside a successful eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWarning {
    /// `evict_for_space` asked for more room than the window holds; the whole
    /// window was discarded and the step runs on sink-only context.
    Capacity { requested: usize, recent_size: usize },
    /// `evict_range` removed sink-zone entries. Sink permanence no longer holds
    /// until the caller adjusts `start_size`.
    SinkZoneEvicted {
        begin: usize,
        end: usize,
        start_size: usize,
    },
}

impl std::fmt::Display for CacheWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheWarning::Capacity {
                requested,
                recent_size,
            } => write!(
                f,
                "requested space for {requested} tokens exceeds recent_size \
                 {recent_size}; window discarded"
            ),
            CacheWarning::SinkZoneEvicted {
                begin,
                end,
                start_size,
            } => write!(
                f,
                "evicted range [{begin}, {end}) overlaps sink zone [0, {start_size})"
            ),
        }
    }
}
