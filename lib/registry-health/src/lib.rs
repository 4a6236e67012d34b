//! Health probing and heartbeat monitoring for the service registry
pub mod metrics;
pub mod monitor;
pub mod prober;
pub mod runtime;

#[cfg(test)]
mod test_support;

pub use metrics::HealthMetrics;
pub use monitor::{HeartbeatMonitor, SweepReport};
pub use prober::HealthProber;
pub use runtime::RegistryRuntime;
