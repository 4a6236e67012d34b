//! Wiring of registry, prober and heartbeat monitor behind one handle

use crate::metrics::HealthMetrics;
use crate::monitor::{HeartbeatMonitor, SweepReport};
use crate::prober::HealthProber;
use anyhow::Result;
use registry_core::{RegistryConfig, RegistryStore, ServiceHealth, ServiceRegistry};
use std::sync::Arc;
use tracing::info;

/// Owns the registry and its health machinery for the lifetime of the process.
///
/// Construct one at startup and hand out [`RegistryRuntime::registry`] to
/// consumers that only need registration and discovery.
pub struct RegistryRuntime {
    registry: Arc<ServiceRegistry>,
    prober: Arc<HealthProber>,
    monitor: HeartbeatMonitor,
    metrics: HealthMetrics,
}

impl RegistryRuntime {
    pub fn new(store: Arc<dyn RegistryStore>, config: RegistryConfig) -> Result<Self> {
        let registry = Arc::new(ServiceRegistry::new(store, config)?);
        let metrics = HealthMetrics::new()?;
        let prober = Arc::new(HealthProber::new(registry.clone(), metrics.clone())?);
        let monitor = HeartbeatMonitor::new(registry.clone(), prober.clone(), metrics.clone());

        Ok(Self {
            registry,
            prober,
            monitor,
            metrics,
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &HealthMetrics {
        &self.metrics
    }

    /// Load persisted services and instances into memory
    pub async fn initialize(&self) {
        self.registry.initialize().await;
    }

    pub async fn start_heartbeat_monitoring(&self) {
        self.monitor.start().await;
    }

    pub async fn perform_health_check(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> registry_core::Result<ServiceHealth> {
        self.prober.perform_health_check(service_id, instance_id).await
    }

    pub async fn perform_health_checks(&self) -> SweepReport {
        self.monitor.perform_health_checks().await
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor.is_running().await
    }

    /// Stop the heartbeat monitor and drop all in-memory registry state
    pub async fn cleanup(&self) {
        self.monitor.stop().await;
        self.registry.clear().await;
        info!("Registry runtime cleaned up");
    }
}
