//! Registry tuning knobs

use crate::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and concurrency settings shared by the registry, prober and monitor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Period between heartbeat sweeps
    pub heartbeat_interval_ms: u64,
    /// Timeout for a single health probe
    pub probe_timeout_ms: u64,
    /// Maximum heartbeat age for an instance to stay discoverable.
    ///
    /// Healthy probes refresh the heartbeat once per sweep, at probe
    /// completion. With the window equal to `heartbeat_interval_ms`, an
    /// instance that relies on probes alone drops out of discovery for a
    /// moment whenever a probe finishes later in its sweep than the one
    /// before. Instances that need continuous visibility should send their
    /// own heartbeats, or the window should exceed the interval plus
    /// `probe_timeout_ms`.
    pub staleness_window_ms: u64,
    /// Probes in flight at once during a sweep
    pub max_concurrent_probes: usize,
    /// Attempts at a health-driven status write before giving up on conflicts
    pub revision_retries: u32,
    /// Take the probe body's `status` over the HTTP status code on 2xx
    pub trust_body_status: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            staleness_window_ms: 30_000,
            max_concurrent_probes: 64,
            revision_retries: 3,
            trust_body_status: true,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.staleness_window_ms as i64)
    }

    /// Reject settings that would stall the monitor or hide every instance
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "heartbeat_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.staleness_window_ms == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "staleness_window_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_probes == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "max_concurrent_probes must be greater than zero".to_string(),
            ));
        }
        if self.revision_retries == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "revision_retries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
