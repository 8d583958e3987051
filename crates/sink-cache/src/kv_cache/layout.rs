//! Layout descriptors for key/value caches.
//!
//! A descriptor only says which axis of the key tensor and which axis of the
//! value tensor runs along the sequence. Every slicing operation in the cache
//! is parameterised by these two indices.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::core::{CacheError, ModelFamily, Result};

/// Position of the sequence axis inside a family's key/value tensors.
///
/// Selected once at setup, usually via [`LayoutDescriptor::for_family`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayoutDescriptor {
    /// Keys and values both `[batch, heads, seq, head_dim]`.
    #[default]
    Standard,
    /// Keys and values stored as transposes of one another: keys
    /// `[batch, heads, head_dim, seq]`, values `[batch, heads, seq, head_dim]`.
    TransposedValue,
    /// Explicit axis indices for anything else.
    Custom {
        key_seq_dim: usize,
        value_seq_dim: usize,
    },
}

impl LayoutDescriptor {
    pub fn for_family(family: ModelFamily) -> Self {
        match family {
            ModelFamily::Llama | ModelFamily::GptNeoX => LayoutDescriptor::Standard,
            ModelFamily::Mpt => LayoutDescriptor::TransposedValue,
            ModelFamily::Falcon => LayoutDescriptor::Custom {
                key_seq_dim: 1,
                value_seq_dim: 1,
            },
        }
    }

    pub fn key_seq_dim(&self) -> usize {
        match self {
            LayoutDescriptor::Standard => 2,
            LayoutDescriptor::TransposedValue => 3,
            LayoutDescriptor::Custom { key_seq_dim, .. } => *key_seq_dim,
        }
    }

    pub fn value_seq_dim(&self) -> usize {
        match self {
            LayoutDescriptor::Standard | LayoutDescriptor::TransposedValue => 2,
            LayoutDescriptor::Custom { value_seq_dim, .. } => *value_seq_dim,
        }
    }

    /// Sequence length of a key tensor under this layout.
    pub fn key_len(&self, key: &Tensor) -> Result<usize> {
        seq_len_at(key, self.key_seq_dim(), "key")
    }

    /// Sequence length of a value tensor under this layout.
    pub fn value_len(&self, value: &Tensor) -> Result<usize> {
        seq_len_at(value, self.value_seq_dim(), "value")
    }
}

fn seq_len_at(tensor: &Tensor, dim: usize, name: &str) -> Result<usize> {
    let rank = tensor.rank();
    if dim >= rank {
        return Err(CacheError::InvalidConfig(format!(
            "{name} sequence axis {dim} out of range for rank-{rank} tensor {:?}",
            tensor.dims()
        )));
    }
    Ok(tensor.dims()[dim])
}
