//! Engine configuration.
//!
//! The surrounding system owns file handling; the engine takes the parsed
//! struct at connection time. Missing keys fall back to defaults, so a
//! partial TOML document is accepted.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Global alignment interval for the default update policy, in milliseconds.
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The shared interval `D` that Default-policy subscriptions align to.
    /// Also the initial spacing of unavailable-resource probes.
    pub default_interval_ms: u64,
    /// Whether introspection may issue live-value reads to discover the
    /// field layout of composites lacking static structure. When disabled,
    /// pending schema is resolved only through values observed by reads.
    pub introspection_sampling: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
            introspection_sampling: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        toml::from_str(text).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }

    pub fn with_default_interval_ms(mut self, interval_ms: u64) -> Self {
        self.default_interval_ms = interval_ms;
        self
    }

    pub fn with_introspection_sampling(mut self, enabled: bool) -> Self {
        self.introspection_sampling = enabled;
        self
    }
}
