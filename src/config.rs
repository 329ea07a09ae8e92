//! Runtime configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::BrokerId;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The ID of this controller node.
    pub node_id: BrokerId,

    /// The number of milliseconds after its last heartbeat at which a broker is considered dead.
    #[serde(default = "Config::default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// The number of milliseconds between sweeps for brokers whose session has expired.
    #[serde(default = "Config::default_liveness_check_interval_ms")]
    pub liveness_check_interval_ms: u64,
    /// The number of most recent snapshots kept available to readers.
    #[serde(default = "Config::default_retained_snapshots")]
    pub retained_snapshots: usize,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()
    }

    /// Create a new config instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Self {
        Self {
            rust_log: "error".into(),
            node_id: 0,
            session_timeout_ms: 1000,
            liveness_check_interval_ms: 50,
            retained_snapshots: 2,
        }
    }

    /// Validate the values of this config.
    pub(crate) fn validate(self) -> Result<Self> {
        if self.session_timeout_ms == 0 {
            bail!("SESSION_TIMEOUT_MS must be greater than 0");
        }
        if self.liveness_check_interval_ms == 0 {
            bail!("LIVENESS_CHECK_INTERVAL_MS must be greater than 0");
        }
        if self.retained_snapshots == 0 {
            bail!("RETAINED_SNAPSHOTS must be at least 1");
        }
        Ok(self)
    }

    /// The broker session timeout.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// The interval at which to sweep for brokers whose session has expired.
    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }

    fn default_session_timeout_ms() -> u64 {
        18_000
    }

    fn default_liveness_check_interval_ms() -> u64 {
        1_000
    }

    fn default_retained_snapshots() -> usize {
        3
    }
}
