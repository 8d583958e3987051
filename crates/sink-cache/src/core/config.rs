//! Configuration options for the bounded cache.
//!
//! [`StreamingConfig`] captures the sink/window split and the tensor layout.
//! It is chosen once when streaming is enabled for a sequence and stays fixed
//! for that sequence's lifetime.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CacheError, Result};
use crate::kv_cache::LayoutDescriptor;

/// Environment variable overriding [`StreamingConfig::start_size`].
pub const ENV_START_SIZE: &str = "SINK_CACHE_START_SIZE";
/// Environment variable overriding [`StreamingConfig::recent_size`].
pub const ENV_RECENT_SIZE: &str = "SINK_CACHE_RECENT_SIZE";

/// Sink/window sizing plus the layout used to locate the sequence axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Number of attention-sink tokens kept permanently at the front.
    pub start_size: usize,
    /// Capacity of the sliding window of most recent tokens.
    pub recent_size: usize,
    /// Where the sequence axis sits in key and value tensors.
    #[serde(default)]
    pub layout: LayoutDescriptor,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            start_size: 4,
            recent_size: 2000,
            layout: LayoutDescriptor::Standard,
        }
    }
}

impl StreamingConfig {
    pub fn new(start_size: usize, recent_size: usize, layout: LayoutDescriptor) -> Result<Self> {
        let cfg = Self {
            start_size,
            recent_size,
            layout,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build a config whose layout is selected from the model family.
    pub fn for_family(family: ModelFamily, start_size: usize, recent_size: usize) -> Result<Self> {
        Self::new(start_size, recent_size, LayoutDescriptor::for_family(family))
    }

    pub fn validate(&self) -> Result<()> {
        if self.recent_size == 0 {
            return Err(CacheError::InvalidConfig(
                "recent_size must be greater than zero".into(),
            ));
        }
        if self.start_size.checked_add(self.recent_size).is_none() {
            return Err(CacheError::InvalidConfig(
                "start_size + recent_size overflows".into(),
            ));
        }
        Ok(())
    }

    /// Hard upper bound on retained sequence length.
    pub fn cache_size(&self) -> usize {
        self.start_size.saturating_add(self.recent_size)
    }

    pub fn key_seq_dim(&self) -> usize {
        self.layout.key_seq_dim()
    }

    pub fn value_seq_dim(&self) -> usize {
        self.layout.value_seq_dim()
    }

    /// Layer `SINK_CACHE_START_SIZE` / `SINK_CACHE_RECENT_SIZE` on top of the
    /// current values. Unparsable or invalid overrides are logged and skipped.
    pub fn apply_env_overrides(&mut self) {
        if let Some(start) = read_env_usize(ENV_START_SIZE) {
            self.start_size = start;
        }
        if let Some(recent) = read_env_usize(ENV_RECENT_SIZE) {
            if recent == 0 {
                log::warn!("{ENV_RECENT_SIZE}=0 ignored; recent_size must be positive");
            } else {
                self.recent_size = recent;
            }
        }
    }
}

fn read_env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("ignoring {key}={raw:?}: {err}");
            None
        }
    }
}

/// Model families with a known key/value cache layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Llama,
    Mpt,
    /// GPT-NeoX and Pythia checkpoints.
    GptNeoX,
    Falcon,
}

impl FromStr for ModelFamily {
    type Err = CacheError;

    /// Match a model-type identifier such as `"LlamaForCausalLM"` or
    /// `"EleutherAI/pythia-2.8b"`.
    fn from_str(s: &str) -> Result<Self> {
        let tag = s.to_ascii_lowercase();
        if tag.contains("llama") {
            Ok(ModelFamily::Llama)
        } else if tag.contains("mpt") {
            Ok(ModelFamily::Mpt)
        } else if tag.contains("pythia") || tag.contains("gpt_neox") || tag.contains("gpt-neox") {
            Ok(ModelFamily::GptNeoX)
        } else if tag.contains("falcon") || tag.contains("refinedweb") {
            Ok(ModelFamily::Falcon)
        } else {
            Err(CacheError::UnsupportedFamily(s.to_string()))
        }
    }
}
