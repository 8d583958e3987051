//! Integration points with the numeric side of the model.

pub mod rope_adapter;

pub use rope_adapter::{rotate_along, RopeAdapter, RotaryTableProvider, RotaryTables};
