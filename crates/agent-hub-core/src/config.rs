//! Hub tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime configuration for the hub core.
///
/// Every field has a default, so a partial config file only needs the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Idle time after which a session is expired by the sweep.
    pub session_timeout_secs: u64,
    /// Period of the expiry sweep.
    pub sweep_interval_secs: u64,
    /// Events retained per stream before the oldest is evicted.
    pub max_events_per_stream: usize,
    /// Stream buffers retained before the oldest stream is dropped.
    pub max_streams: usize,
    /// Upper bound on a single push to a live transport.
    pub push_timeout_ms: u64,
    /// Register an agent named after `client_info.name` when a session opens.
    pub auto_register_clients: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 300,
            sweep_interval_secs: 60,
            max_events_per_stream: 1000,
            max_streams: 1024,
            push_timeout_ms: 5000,
            auto_register_clients: false,
        }
    }
}

impl HubConfig {
    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub const fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    /// Reject values that would disable expiry or buffering.
    ///
    /// # Errors
    /// Returns the first field found to be zero.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout_secs == 0 {
            return Err(ConfigError::Zero("session_timeout_secs"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Zero("sweep_interval_secs"));
        }
        if self.max_events_per_stream == 0 {
            return Err(ConfigError::Zero("max_events_per_stream"));
        }
        if self.max_streams == 0 {
            return Err(ConfigError::Zero("max_streams"));
        }
        if self.push_timeout_ms == 0 {
            return Err(ConfigError::Zero("push_timeout_ms"));
        }
        Ok(())
    }
}
