//! Load-time configuration
//!
//! The two tunables of the module (`delay` for the delay selector and `tdelay`
//! for the trace collector) are fixed when the module is loaded and passed to
//! each component explicitly. There are no process-wide mutable globals.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default tick rate (ticks per second)
pub const DEFAULT_HZ: u32 = 250;

/// Default delay selector duration, in ticks
pub const DEFAULT_DELAY: u64 = 1;

/// Default inter-fire delay for timer runs, in ticks
pub const DEFAULT_TDELAY: u64 = 10;

/// Default bound on concurrently in-flight trace runs
pub const DEFAULT_MAX_INFLIGHT_RUNS: usize = 64;

/// Highest tick rate accepted
pub const MAX_HZ: u32 = 1_000_000;

/// Longest `delay` or `tdelay` accepted, in ticks
pub const MAX_DELAY_TICKS: u64 = u32::MAX as u64;

/// Errors raised while loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Configuration shared by the delay selector and the trace collector
///
/// # Example
/// ```
/// use jitprobe::config::JitConfig;
///
/// let config = JitConfig::new().with_delay(25).with_tdelay(5);
/// assert_eq!(config.delay, 25);
/// assert_eq!(config.tdelay, 5);
/// assert_eq!(config.hz, 250);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Delay selector duration in ticks (`jitbusy`, `jitsched`, ...)
    pub delay: u64,

    /// Inter-fire delay for the timer variant, in ticks
    pub tdelay: u64,

    /// Tick rate of the simulated tick counter
    pub hz: u32,

    /// Maximum number of trace runs in flight at once
    pub max_inflight_runs: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            tdelay: DEFAULT_TDELAY,
            hz: DEFAULT_HZ,
            max_inflight_runs: DEFAULT_MAX_INFLIGHT_RUNS,
        }
    }
}

impl JitConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay selector duration in ticks
    pub fn with_delay(mut self, ticks: u64) -> Self {
        self.delay = ticks;
        self
    }

    /// Set the timer inter-fire delay in ticks
    pub fn with_tdelay(mut self, ticks: u64) -> Self {
        self.tdelay = ticks;
        self
    }

    /// Set the tick rate
    ///
    /// # Example
    /// ```
    /// use jitprobe::config::JitConfig;
    /// use std::time::Duration;
    ///
    /// let config = JitConfig::new().with_hz(1000);
    /// assert_eq!(config.tick(), Duration::from_millis(1));
    /// ```
    pub fn with_hz(mut self, hz: u32) -> Self {
        self.hz = hz;
        self
    }

    /// Set the bound on concurrently in-flight trace runs
    pub fn with_max_inflight_runs(mut self, runs: usize) -> Self {
        self.max_inflight_runs = runs;
        self
    }

    /// Length of one tick
    pub fn tick(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.hz.max(1)))
    }

    /// Check that every field is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hz == 0 || self.hz > MAX_HZ {
            return Err(ConfigError::Invalid {
                field: "hz",
                reason: format!("{} is outside 1..={}", self.hz, MAX_HZ),
            });
        }
        check_ticks("delay", self.delay)?;
        check_ticks("tdelay", self.tdelay)?;
        if self.max_inflight_runs == 0 {
            return Err(ConfigError::Invalid {
                field: "max_inflight_runs",
                reason: "must allow at least one run".to_string(),
            });
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    ///
    /// Missing keys keep their defaults.
    ///
    /// # Example
    /// ```
    /// use jitprobe::config::JitConfig;
    ///
    /// let config = JitConfig::from_toml_str("tdelay = 3\nhz = 100\n").unwrap();
    /// assert_eq!(config.tdelay, 3);
    /// assert_eq!(config.hz, 100);
    /// assert_eq!(config.delay, 1);
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: JitConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

fn check_ticks(field: &'static str, ticks: u64) -> Result<(), ConfigError> {
    if ticks == 0 || ticks > MAX_DELAY_TICKS {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{} is outside 1..={} ticks", ticks, MAX_DELAY_TICKS),
        });
    }
    Ok(())
}
