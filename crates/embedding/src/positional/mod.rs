//! Positional encodings.

pub mod rope;

pub use rope::{apply_rotary_at_positions, sin_cos_tables, RopeConfig};
