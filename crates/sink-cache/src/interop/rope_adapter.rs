//! Rotary table provisioning.
//!
//! The cache only decides which integer position each query and key uses.
//! Turning those integers into angles is delegated to a
//! [`RotaryTableProvider`]; [`RopeAdapter`] is the default provider, backed by
//! the embedding crate and growing its cached tables on demand.

use candle_core::{bail, Device, Result, Tensor};
use embedding::positional::rope::{apply_rotary_at_positions, sin_cos_tables, RopeConfig};

/// Sine/cosine tables indexable by logical position.
///
/// Both tensors are shaped `[rows, rotate_dim / 2]` with `rows >= ` the
/// requested table length.
#[derive(Debug, Clone)]
pub struct RotaryTables {
    pub sin: Tensor,
    pub cos: Tensor,
}

impl RotaryTables {
    pub fn rows(&self) -> usize {
        self.sin.dims().first().copied().unwrap_or(0)
    }
}

/// External numeric kernel supplying rotary tables.
pub trait RotaryTableProvider {
    /// Tables covering at least positions `[0, table_len)` for heads of width
    /// `head_dim`.
    fn tables(&mut self, table_len: usize, head_dim: usize) -> Result<RotaryTables>;
}

/// Adapter that bridges the cache with the positional embedding crate.
#[derive(Debug, Clone)]
pub struct RopeAdapter {
    config: RopeConfig,
    device: Device,
    tables: Option<RotaryTables>,
}

impl RopeAdapter {
    /// Create a new adapter bound to the provided configuration and device.
    pub fn new(config: RopeConfig, device: Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device,
            tables: None,
        })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Rows currently held in the cached tables.
    pub fn coverage(&self) -> usize {
        self.tables.as_ref().map(RotaryTables::rows).unwrap_or(0)
    }
}

impl RotaryTableProvider for RopeAdapter {
    fn tables(&mut self, table_len: usize, head_dim: usize) -> Result<RotaryTables> {
        if table_len == 0 {
            bail!("table_len must be non-zero");
        }
        if head_dim != self.config.head_dim {
            bail!(
                "head_dim {} does not match rope config head_dim {}",
                head_dim,
                self.config.head_dim
            );
        }

        match &self.tables {
            Some(cached) if cached.rows() >= table_len => Ok(cached.clone()),
            _ => {
                log::debug!(
                    "rope tables grow: {} -> {} rows",
                    self.coverage(),
                    table_len
                );
                let (sin, cos) = sin_cos_tables(table_len, &self.config, &self.device)?;
                let tables = RotaryTables { sin, cos };
                self.tables = Some(tables.clone());
                Ok(tables)
            }
        }
    }
}

/// Rotate `x` whose sequence runs along `seq_dim`, one table row per slot.
///
/// Features sit on the last axis, except when the sequence itself is last
/// (transposed keys); then features are on the axis before it.
pub fn rotate_along(
    x: &Tensor,
    seq_dim: usize,
    positions: &[u32],
    tables: &RotaryTables,
) -> Result<Tensor> {
    let rank = x.rank();
    if rank < 2 || seq_dim >= rank {
        bail!(
            "sequence axis {} invalid for rotary input {:?}",
            seq_dim,
            x.dims()
        );
    }
    if seq_dim == rank - 2 {
        return apply_rotary_at_positions(x, positions, &tables.sin, &tables.cos);
    }
    // One transpose brings the sequence next to the features in both cases.
    let seq_major = x.transpose(seq_dim, rank - 2)?;
    apply_rotary_at_positions(&seq_major, positions, &tables.sin, &tables.cos)?
        .transpose(seq_dim, rank - 2)?
        .contiguous()
}
