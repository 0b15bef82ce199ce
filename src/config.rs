//! Configuration management for Sluice.
//!
//! Limits are loaded from YAML in a form like:
//!
//! ```yaml
//! log_level: debug
//! limits:
//!   - max_count: 2
//!     unit: second
//!   - max_count: 5
//!     unit: second
//!     units: 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, SluiceError};
use crate::throttle::{RateThrottler, ThrottleLimit, TimeUnit};

/// Main configuration for a Sluice throttler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Default log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Limits enforced by the throttler
    #[serde(default)]
    pub limits: Vec<LimitRule>,
}

impl Default for SluiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            limits: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A single limit as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Executions allowed per window; zero disables this entry
    pub max_count: i64,
    /// The time unit of the window
    pub unit: TimeUnit,
    /// How many units make up the window
    #[serde(default = "default_units")]
    pub units: u32,
}

fn default_units() -> u32 {
    1
}

impl LimitRule {
    /// Convert this rule into a validated limit.
    pub fn to_limit(&self) -> Result<ThrottleLimit> {
        if self.units == 0 {
            return Err(SluiceError::Config(
                "limit window must span at least one unit".to_string(),
            ));
        }
        ThrottleLimit::new(self.unit.duration() * self.units, self.max_count)
    }
}

impl SluiceConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SluiceError::Config(format!("Failed to parse throttle config: {}", e)))
    }

    /// Convert every configured rule into a limit.
    pub fn throttle_limits(&self) -> Result<Vec<ThrottleLimit>> {
        self.limits.iter().map(LimitRule::to_limit).collect()
    }

    /// Build a throttler enforcing the configured limits.
    pub fn build_throttler(&self) -> Result<RateThrottler> {
        RateThrottler::new(self.throttle_limits()?)
    }
}
