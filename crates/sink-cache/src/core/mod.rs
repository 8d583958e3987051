//! Configuration and error types shared across the crate.
//!
//! Every operation returns [`Result`]; warnings that must not abort a step are
//! carried as [`CacheWarning`] values inside successful outcomes.

pub mod config;
pub mod errors;

pub use config::{ModelFamily, StreamingConfig, ENV_RECENT_SIZE, ENV_START_SIZE};
pub use errors::{CacheError, CacheWarning, Result};
