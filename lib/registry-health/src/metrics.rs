//! Prometheus metrics for health probes and heartbeat sweeps

use crate::monitor::SweepReport;
use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};
use registry_core::ServiceHealth;
use std::sync::Arc;
use std::time::Duration;

/// Prometheus metrics collector for the health monitor
#[derive(Clone)]
pub struct HealthMetrics {
    /// Probes issued, by resulting health status
    pub probes_total: CounterVec,
    /// Probe round trip in seconds
    pub probe_duration_seconds: Histogram,
    /// Completed heartbeat sweeps
    pub sweeps_total: Counter,
    /// Checks that failed before a probe could run (unknown service or instance)
    pub check_errors_total: Counter,
    /// Wall time of a full sweep in seconds
    pub sweep_duration_seconds: Histogram,
    /// Instances whose status was healthy after the last sweep
    pub healthy_instances: IntGauge,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl HealthMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let probes_total = CounterVec::new(
            Opts::new("registry_probes_total", "Total health probes by result"),
            &["result"],
        )?;

        let probe_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "registry_probe_duration_seconds",
            "Health probe latency in seconds",
        ))?;

        let sweeps_total = Counter::new("registry_sweeps_total", "Total heartbeat sweeps")?;

        let check_errors_total = Counter::new(
            "registry_check_errors_total",
            "Health checks that could not be probed",
        )?;

        let sweep_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "registry_sweep_duration_seconds",
            "Heartbeat sweep duration in seconds",
        ))?;

        let healthy_instances = IntGauge::new(
            "registry_healthy_instances",
            "Instances with healthy status after the last sweep",
        )?;

        registry.register(Box::new(probes_total.clone()))?;
        registry.register(Box::new(probe_duration_seconds.clone()))?;
        registry.register(Box::new(sweeps_total.clone()))?;
        registry.register(Box::new(check_errors_total.clone()))?;
        registry.register(Box::new(sweep_duration_seconds.clone()))?;
        registry.register(Box::new(healthy_instances.clone()))?;

        Ok(Self {
            probes_total,
            probe_duration_seconds,
            sweeps_total,
            check_errors_total,
            sweep_duration_seconds,
            healthy_instances,
            registry,
        })
    }

    pub fn observe_probe(&self, health: &ServiceHealth) {
        self.probes_total
            .with_label_values(&[health.status.as_str()])
            .inc();
        self.probe_duration_seconds
            .observe(health.response_time as f64 / 1000.0);
    }

    pub fn observe_sweep(&self, report: &SweepReport, elapsed: Duration) {
        self.sweeps_total.inc();
        self.check_errors_total.inc_by(report.failed as f64);
        self.sweep_duration_seconds.observe(elapsed.as_secs_f64());
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
