//! Embedding crate
//!
//! The positional module exposes rotary positional embedding tables and the
//! position-indexed rotation applied to queries and keys.

pub mod positional;

pub use positional::*;
