//! Rotary positional embedding tables and position-indexed rotation.
//!
//! Tables are plain functions of an integer position: row `p` of the sine
//! table holds `sin(p * θ^(-2i/rotate_dim))` for every frequency `i`. Callers
//! decide which integer each token uses; this module never tracks how many
//! tokens have been seen.

use candle_core::{bail, DType, Device, Result, Tensor};

/// Configuration for building rotary positional embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the representations being rotated (commonly 64 or 128).
    pub head_dim: usize,
    /// Base angle parameter θ controlling the RoPE frequency spectrum (defaults to 10k).
    pub rope_theta: f32,
    /// Optional override for how many dimensions to rotate; `None` implies the full `head_dim`.
    pub rotate_dim: Option<usize>,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: 10_000.0,
            rotate_dim: None,
        }
    }
}

impl RopeConfig {
    /// Config rotating every feature of a `head_dim`-wide head.
    pub fn new(head_dim: usize) -> Self {
        Self {
            head_dim,
            ..Self::default()
        }
    }

    /// Number of leading features that get rotated.
    pub fn effective_rotate_dim(&self) -> usize {
        self.rotate_dim.unwrap_or(self.head_dim)
    }

    /// Check the geometry before any table is built.
    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        let rotate_dim = self.effective_rotate_dim();
        if rotate_dim < 2 || rotate_dim > self.head_dim {
            bail!(
                "invalid rotate_dim {} for head_dim {}",
                rotate_dim,
                self.head_dim
            );
        }
        if rotate_dim % 2 != 0 {
            bail!("rotate_dim must be even to pair dimensions");
        }
        if !self.rope_theta.is_finite() || self.rope_theta <= 0.0 {
            bail!("rope_theta must be positive, got {}", self.rope_theta);
        }
        Ok(())
    }
}

/// Build `(sin, cos)` tables covering positions `[0, table_len)`.
///
/// Both tensors are **f32**, shaped `[table_len, rotate_dim / 2]`.
pub fn sin_cos_tables(
    table_len: usize,
    cfg: &RopeConfig,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    if table_len == 0 {
        bail!("table_len must be non-zero");
    }
    cfg.validate()?;

    let rotate_dim = cfg.effective_rotate_dim();
    let half_dim = rotate_dim / 2;
    let base = cfg.rope_theta as f64;
    let inv_freqs: Vec<f64> = (0..half_dim)
        .map(|idx| base.powf(-((2 * idx) as f64 / rotate_dim as f64)))
        .collect();

    let mut sin_data = Vec::with_capacity(table_len * half_dim);
    let mut cos_data = Vec::with_capacity(table_len * half_dim);
    for pos in 0..table_len {
        let pos_f = pos as f64;
        for &inv_freq in &inv_freqs {
            let angle = pos_f * inv_freq;
            sin_data.push(angle.sin() as f32);
            cos_data.push(angle.cos() as f32);
        }
    }

    let sin = Tensor::from_vec(sin_data, (table_len, half_dim), device)?;
    let cos = Tensor::from_vec(cos_data, (table_len, half_dim), device)?;
    log::debug!(
        "rope sin/cos tables built: rows={} rotate_dim={} theta={}",
        table_len,
        rotate_dim,
        cfg.rope_theta
    );
    Ok((sin, cos))
}

/// Rotate a tensor laid out as `[.., seq_len, head_dim]` using one table row per
/// sequence slot.
///
/// * `positions[i]` selects the table row used for slot `i` along the
///   second-to-last axis, so positions need not be contiguous or start at zero.
/// * The rotated width is `2 * sin.dim(1)`; trailing features beyond it are
///   copied through untouched.
/// * Adjacent feature pairs `(2j, 2j + 1)` are rotated together. Math runs in
///   f32 and the output mirrors the input dtype.
pub fn apply_rotary_at_positions(
    x: &Tensor,
    positions: &[u32],
    sin: &Tensor,
    cos: &Tensor,
) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let rank = dims.len();
    if rank < 2 {
        bail!("rotary input must have at least 2 dims, got {:?}", dims);
    }
    let seq_len = dims[rank - 2];
    let head_dim = dims[rank - 1];
    if positions.len() != seq_len {
        bail!(
            "expected {} positions for sequence axis, got {}",
            seq_len,
            positions.len()
        );
    }

    let (sin_rows, half_dim) = sin.dims2()?;
    let (cos_rows, cos_half) = cos.dims2()?;
    if (sin_rows, half_dim) != (cos_rows, cos_half) {
        bail!(
            "sin/cos table shape mismatch: sin={:?} cos={:?}",
            sin.dims(),
            cos.dims()
        );
    }
    let rotate_dim = half_dim * 2;
    if rotate_dim == 0 || rotate_dim > head_dim {
        bail!("invalid rotate_dim {} for head_dim {}", rotate_dim, head_dim);
    }
    if let Some(&max_pos) = positions.iter().max() {
        if max_pos as usize >= sin_rows {
            bail!(
                "position {} exceeds rotary table of {} rows",
                max_pos,
                sin_rows
            );
        }
    }
    if seq_len == 0 {
        return Ok(x.clone());
    }

    let index = Tensor::from_vec(positions.to_vec(), (seq_len,), sin.device())?;
    let mut half_shape = dims.clone();
    half_shape[rank - 1] = half_dim;
    let sin_b = sin
        .index_select(&index, 0)?
        .to_dtype(DType::F32)?
        .broadcast_as(half_shape.clone())?;
    let cos_b = cos
        .index_select(&index, 0)?
        .to_dtype(DType::F32)?
        .broadcast_as(half_shape.clone())?;

    let dtype = x.dtype();
    let mut pair_shape = half_shape.clone();
    pair_shape.push(2);
    let pairs = x
        .narrow(rank - 1, 0, rotate_dim)?
        .to_dtype(DType::F32)?
        .contiguous()?
        .reshape(pair_shape)?;
    let even = pairs.narrow(rank, 0, 1)?.squeeze(rank)?;
    let odd = pairs.narrow(rank, 1, 1)?.squeeze(rank)?;

    let rotated_even = even.mul(&cos_b)?.sub(&odd.mul(&sin_b)?)?;
    let rotated_odd = odd.mul(&cos_b)?.add(&even.mul(&sin_b)?)?;

    let mut out_shape = dims.clone();
    out_shape[rank - 1] = rotate_dim;
    let rotated = Tensor::stack(&[&rotated_even, &rotated_odd], rank)?
        .reshape(out_shape)?
        .to_dtype(dtype)?;

    let tail_dim = head_dim - rotate_dim;
    if tail_dim == 0 {
        Ok(rotated)
    } else {
        let tail = x.narrow(rank - 1, rotate_dim, tail_dim)?;
        Tensor::cat(&[&rotated, &tail], rank - 1)
    }
}
