//! Configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! [engine]
//! max_iterations = 3
//!
//! [watchdog]
//! interval_secs = 120
//! budget_usd = 1.0
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundryConfig {
    /// Orchestrator and module loop settings
    pub engine: EngineConfig,
    /// Monitor settings
    pub watchdog: WatchdogConfig,
}

impl FoundryConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML, [`ConfigError::Invalid`]
    /// for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`FoundryConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// [`ConfigError::Render`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_iterations == 0 {
            return Err(ConfigError::Invalid("engine.max_iterations must be at least 1".into()));
        }
        if self.engine.writer_mailbox == 0 {
            return Err(ConfigError::Invalid("engine.writer_mailbox must be at least 1".into()));
        }
        if self.watchdog.interval_secs == 0 {
            return Err(ConfigError::Invalid("watchdog.interval_secs must be at least 1".into()));
        }
        if self.watchdog.error_threshold == 0 {
            return Err(ConfigError::Invalid("watchdog.error_threshold must be at least 1".into()));
        }
        if !self.watchdog.budget_usd.is_finite() || self.watchdog.budget_usd < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "watchdog.budget_usd must be a non-negative number, got {}",
                self.watchdog.budget_usd
            )));
        }
        Ok(())
    }

    /// With per-module iteration budget
    #[inline]
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.engine.max_iterations = max;
        self
    }

    /// With watchdog period
    #[inline]
    #[must_use]
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog.interval_secs = interval.as_secs();
        self
    }

    /// With staleness threshold
    #[inline]
    #[must_use]
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.watchdog.stale_threshold_secs = threshold.as_secs();
        self
    }

    /// With cost budget
    #[inline]
    #[must_use]
    pub fn with_budget_usd(mut self, budget: f64) -> Self {
        self.watchdog.budget_usd = budget;
        self
    }
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Refine cycles before a module fails
    pub max_iterations: u32,
    /// Capacity of each per-workflow writer mailbox
    pub writer_mailbox: usize,
    /// Compare-and-set attempts per mutation
    pub cas_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            writer_mailbox: 64,
            cas_retries: 8,
        }
    }
}

/// Watchdog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Scan period in seconds
    pub interval_secs: u64,
    /// Idle time before a workflow is flagged stale
    pub stale_threshold_secs: u64,
    /// Error count that raises a risk
    pub error_threshold: usize,
    /// Cost above which an alert is raised
    pub budget_usd: f64,
}

impl WatchdogConfig {
    /// Scan period
    #[inline]
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Staleness threshold
    #[inline]
    #[must_use]
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            stale_threshold_secs: 600,
            error_threshold: 3,
            budget_usd: 1.0,
        }
    }
}
