//! Heartbeat monitor: periodic health sweeps over every probe-eligible instance
//!
//! A sweep snapshots the healthy and unhealthy instances, probes them
//! concurrently (bounded by `max_concurrent_probes`) and waits for the whole
//! batch. The next tick is only taken once the batch has finished, so sweeps
//! never overlap.

use crate::metrics::HealthMetrics;
use crate::prober::HealthProber;
use futures::stream::{self, StreamExt};
use registry_core::{HealthStatus, ServiceRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome counts of one heartbeat sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Instances a check was issued for
    pub probed: usize,
    pub healthy: usize,
    /// Unhealthy or degraded results
    pub unhealthy: usize,
    /// Checks that errored before probing
    pub failed: usize,
}

/// Running loop state
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Drives periodic health sweeps
pub struct HeartbeatMonitor {
    registry: Arc<ServiceRegistry>,
    prober: Arc<HealthProber>,
    metrics: HealthMetrics,
    slot: Mutex<Option<MonitorSlot>>,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        prober: Arc<HealthProber>,
        metrics: HealthMetrics,
    ) -> Self {
        Self {
            registry,
            prober,
            metrics,
            slot: Mutex::new(None),
        }
    }

    /// Start the periodic sweep loop. The first sweep runs one interval after start.
    pub async fn start(&self) {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            warn!("Heartbeat monitor already running");
            return;
        }

        let period = self.registry.config().heartbeat_interval();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let prober = self.prober.clone();
        let metrics = self.metrics.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat_loop(registry, prober, metrics, period, shutdown_rx).await;
        });

        info!("Heartbeat monitor started with interval: {:?}", period);
        *slot = Some(MonitorSlot {
            handle,
            shutdown_tx,
        });
    }

    /// Stop the loop, abandoning any sweep in flight
    pub async fn stop(&self) {
        let Some(slot) = self.slot.lock().await.take() else {
            return;
        };
        let _ = slot.shutdown_tx.send(true);
        slot.handle.abort();
        let _ = slot.handle.await;
        info!("Heartbeat monitor stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Run one sweep now
    pub async fn perform_health_checks(&self) -> SweepReport {
        run_sweep(&self.registry, &self.prober, &self.metrics).await
    }
}

async fn run_heartbeat_loop(
    registry: Arc<ServiceRegistry>,
    prober: Arc<HealthProber>,
    metrics: HealthMetrics,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = run_sweep(&registry, &prober, &metrics).await;
                debug!(
                    "Heartbeat sweep: {} probed, {} healthy, {} unhealthy, {} failed",
                    report.probed, report.healthy, report.unhealthy, report.failed
                );
            }
            _ = shutdown_rx.changed() => {
                debug!("Heartbeat loop received shutdown");
                break;
            }
        }
    }
}

async fn run_sweep(
    registry: &ServiceRegistry,
    prober: &HealthProber,
    metrics: &HealthMetrics,
) -> SweepReport {
    let started = Instant::now();
    let targets = registry.probe_targets().await;
    let limit = registry.config().max_concurrent_probes;

    let results: Vec<_> = stream::iter(targets)
        .map(move |(service_id, instance_id)| async move {
            let result = prober.perform_health_check(&service_id, &instance_id).await;
            (service_id, instance_id, result)
        })
        .buffer_unordered(limit)
        .collect()
        .await;

    let mut report = SweepReport {
        probed: results.len(),
        ..Default::default()
    };
    for (service_id, instance_id, result) in results {
        match result {
            Ok(health) if health.status == HealthStatus::Healthy => report.healthy += 1,
            Ok(_) => report.unhealthy += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    "Health check for {}/{} failed: {}",
                    service_id, instance_id, e
                );
            }
        }
    }

    let stats = registry.get_service_statistics().await;
    metrics.healthy_instances.set(stats.healthy_instances as i64);
    metrics.observe_sweep(&report, started.elapsed());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port, spawn_health_server};
    use hyper::StatusCode;
    use registry_core::{
        InstanceStatus, MemoryStore, RegistryConfig, ServiceDefinition, ServiceInstance,
    };

    fn monitor(config: RegistryConfig) -> (Arc<ServiceRegistry>, HeartbeatMonitor) {
        let registry = Arc::new(ServiceRegistry::new(Arc::new(MemoryStore::new()), config).unwrap());
        let metrics = HealthMetrics::new().unwrap();
        let prober = Arc::new(HealthProber::new(registry.clone(), metrics.clone()).unwrap());
        let monitor = HeartbeatMonitor::new(registry.clone(), prober, metrics);
        (registry, monitor)
    }

    async fn add_instance(
        registry: &ServiceRegistry,
        instance_id: &str,
        endpoint: String,
        status: InstanceStatus,
    ) {
        registry
            .register_instance(ServiceInstance::new("pricing", instance_id, endpoint, status))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_skips_starting_and_survives_failures() {
        let healthy = spawn_health_server(StatusCode::OK, "{}", Duration::ZERO).await;
        let failing = spawn_health_server(StatusCode::SERVICE_UNAVAILABLE, "", Duration::ZERO).await;
        let starting = spawn_health_server(StatusCode::OK, "{}", Duration::ZERO).await;

        let (registry, monitor) = monitor(RegistryConfig::default());
        registry
            .register_service(ServiceDefinition::new("pricing", "Pricing"))
            .await
            .unwrap();
        add_instance(&registry, "i1", healthy.url(), InstanceStatus::Unhealthy).await;
        add_instance(&registry, "i2", failing.url(), InstanceStatus::Healthy).await;
        add_instance(
            &registry,
            "i3",
            format!("http://{}", closed_port().await),
            InstanceStatus::Healthy,
        )
        .await;
        add_instance(&registry, "i4", starting.url(), InstanceStatus::Starting).await;

        let report = monitor.perform_health_checks().await;
        assert_eq!(
            report,
            SweepReport {
                probed: 3,
                healthy: 1,
                unhealthy: 2,
                failed: 0,
            }
        );
        assert_eq!(starting.hits(), 0);

        let discoverable: Vec<String> = registry
            .get_healthy_instances("pricing")
            .await
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        assert_eq!(discoverable, vec!["i1"]);
        assert_eq!(
            registry.get_instance("pricing", "i2").await.unwrap().status,
            InstanceStatus::Unhealthy
        );
        assert_eq!(
            registry.get_instance("pricing", "i4").await.unwrap().status,
            InstanceStatus::Starting
        );
    }

    #[tokio::test]
    async fn test_sweep_probes_concurrently() {
        let slow = spawn_health_server(StatusCode::OK, "{}", Duration::from_millis(300)).await;
        let (registry, monitor) = monitor(RegistryConfig::default());
        registry
            .register_service(ServiceDefinition::new("pricing", "Pricing"))
            .await
            .unwrap();
        for id in ["i1", "i2", "i3", "i4"] {
            add_instance(&registry, id, slow.url(), InstanceStatus::Healthy).await;
        }

        let started = Instant::now();
        let report = monitor.perform_health_checks().await;
        assert_eq!(report.healthy, 4);
        assert!(started.elapsed() < Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn test_empty_registry_sweep() {
        let (_, monitor) = monitor(RegistryConfig::default());
        assert_eq!(monitor.perform_health_checks().await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_loop_probes_until_stopped() {
        let server = spawn_health_server(StatusCode::OK, "{}", Duration::ZERO).await;
        let config = RegistryConfig {
            heartbeat_interval_ms: 50,
            ..Default::default()
        };
        let (registry, monitor) = monitor(config);
        registry
            .register_service(ServiceDefinition::new("pricing", "Pricing"))
            .await
            .unwrap();
        add_instance(&registry, "i1", server.url(), InstanceStatus::Healthy).await;

        monitor.start().await;
        monitor.start().await;
        assert!(monitor.is_running().await);

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.hits() < 2 && Instant::now() < deadline {
            time::sleep(Duration::from_millis(20)).await;
        }
        assert!(server.hits() >= 2);

        monitor.stop().await;
        assert!(!monitor.is_running().await);
        // Let a request already on the wire land before taking the baseline
        time::sleep(Duration::from_millis(50)).await;
        let hits = server.hits();
        time::sleep(Duration::from_millis(250)).await;
        assert_eq!(server.hits(), hits);
    }
}
