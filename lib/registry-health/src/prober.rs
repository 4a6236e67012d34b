//! HTTP health probes for registered instances

use crate::metrics::HealthMetrics;
use anyhow::Result;
use chrono::Utc;
use registry_core::{HealthStatus, RegistryError, ServiceHealth, ServiceRegistry};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{debug, warn};

/// Largest health response body read before the probe is failed
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Optional JSON body of a health endpoint response
#[derive(Debug, Default, Deserialize)]
struct ProbeBody {
    status: Option<HealthStatus>,
    details: Option<Value>,
}

/// Probes instance health endpoints and feeds the results to the registry
pub struct HealthProber {
    client: reqwest::Client,
    registry: Arc<ServiceRegistry>,
    metrics: HealthMetrics,
    timeout: Duration,
    trust_body_status: bool,
}

impl HealthProber {
    /// Create a prober using the registry's probe timeout and body-status policy
    pub fn new(registry: Arc<ServiceRegistry>, metrics: HealthMetrics) -> Result<Self> {
        let config = registry.config().clone();
        // Instances are probed directly, never through an egress proxy
        let client = reqwest::Client::builder()
            .connect_timeout(config.probe_timeout())
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            registry,
            metrics,
            timeout: config.probe_timeout(),
            trust_body_status: config.trust_body_status,
        })
    }

    /// Probe one instance and record the result.
    ///
    /// Fails only when the service or instance is unknown. Any probe failure
    /// becomes an unhealthy record, and the record is returned even if the
    /// registry could not persist it.
    pub async fn perform_health_check(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> registry_core::Result<ServiceHealth> {
        let instance = self
            .registry
            .get_instance(service_id, instance_id)
            .await
            .ok_or_else(|| RegistryError::InstanceNotFound {
                service_id: service_id.to_string(),
                instance_id: instance_id.to_string(),
            })?;
        let service = self
            .registry
            .get_service(service_id)
            .await
            .ok_or_else(|| RegistryError::ServiceNotFound(service_id.to_string()))?;

        let url = format!("{}{}", instance.endpoint, service.health_endpoint);
        let health = self.probe(service_id, instance_id, &url).await;
        self.metrics.observe_probe(&health);

        if let Err(e) = self.registry.update_service_health(health.clone()).await {
            warn!(
                "Health of {}/{} recorded with errors: {}",
                service_id, instance_id, e
            );
        }

        Ok(health)
    }

    /// Issue a single GET against `url` and turn the outcome into a health record
    pub async fn probe(&self, service_id: &str, instance_id: &str, url: &str) -> ServiceHealth {
        let started = Instant::now();
        let outcome = match time::timeout(self.timeout, self.fetch(url)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!(
                "Health check timed out after {}ms",
                self.timeout.as_millis()
            )),
        };
        let response_time = started.elapsed().as_millis() as u64;

        let (status, details) = match outcome {
            Ok(result) => result,
            Err(error) => {
                warn!("Health check of {} failed: {}", url, error);
                let mut details = Map::new();
                details.insert("error".to_string(), Value::String(error));
                (HealthStatus::Unhealthy, details)
            }
        };

        debug!(
            "Probed {}/{} at {}: {} in {}ms",
            service_id,
            instance_id,
            url,
            status.as_str(),
            response_time
        );

        ServiceHealth {
            service_id: service_id.to_string(),
            instance_id: instance_id.to_string(),
            status,
            response_time,
            timestamp: Utc::now(),
            details,
        }
    }

    async fn fetch(&self, url: &str) -> std::result::Result<(HealthStatus, Map<String, Value>), String> {
        let response = self
            .client
            .get(url)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let http_status = response.status();
        if !http_status.is_success() {
            return Err(format!("HTTP {}", http_status.as_u16()));
        }

        let bytes = read_capped(response, MAX_BODY_BYTES).await?;
        let body = if bytes.iter().all(u8::is_ascii_whitespace) {
            ProbeBody::default()
        } else {
            serde_json::from_slice::<ProbeBody>(&bytes)
                .map_err(|e| format!("Invalid health response: {}", e))?
        };

        let status = match body.status {
            Some(status) if self.trust_body_status => status,
            _ => HealthStatus::Healthy,
        };
        let details = match body.details {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
            None => Map::new(),
        };

        Ok((status, details))
    }
}

async fn read_capped(
    mut response: reqwest::Response,
    limit: usize,
) -> std::result::Result<Vec<u8>, String> {
    let too_large = || format!("Health response exceeds {} bytes", limit);
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| e.to_string())? {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port, spawn_health_server};
    use hyper::StatusCode;
    use registry_core::{
        InstanceStatus, MemoryStore, RegistryConfig, ServiceDefinition, ServiceInstance,
    };

    async fn setup(endpoint: String, config: RegistryConfig) -> (Arc<ServiceRegistry>, HealthProber) {
        let registry = Arc::new(ServiceRegistry::new(Arc::new(MemoryStore::new()), config).unwrap());
        registry
            .register_service(
                ServiceDefinition::new("pricing", "Pricing")
                    .with_capability("quote")
                    .with_health_endpoint("/healthz"),
            )
            .await
            .unwrap();
        registry
            .register_instance(ServiceInstance::new(
                "pricing",
                "i1",
                endpoint,
                InstanceStatus::Healthy,
            ))
            .await
            .unwrap();

        let prober = HealthProber::new(registry.clone(), HealthMetrics::new().unwrap()).unwrap();
        (registry, prober)
    }

    #[tokio::test]
    async fn test_healthy_body_makes_instance_discoverable() {
        let server = spawn_health_server(
            StatusCode::OK,
            r#"{"status":"healthy","details":{"db":"ok"}}"#,
            Duration::ZERO,
        )
        .await;
        let (registry, prober) = setup(server.url(), RegistryConfig::default()).await;

        let health = prober.perform_health_check("pricing", "i1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.details["db"], "ok");
        assert_eq!(server.last_path().as_deref(), Some("/healthz"));
        assert_eq!(
            server.last_content_type().as_deref(),
            Some("application/json")
        );

        let healthy = registry.get_healthy_instances("pricing").await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].instance_id, "i1");
    }

    #[tokio::test]
    async fn test_missing_status_defaults_to_healthy() {
        let server = spawn_health_server(StatusCode::NO_CONTENT, "", Duration::ZERO).await;
        let (_, prober) = setup(server.url(), RegistryConfig::default()).await;

        let health = prober.perform_health_check("pricing", "i1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.details.is_empty());
    }

    #[tokio::test]
    async fn test_body_status_is_trusted_over_http_code() {
        let server =
            spawn_health_server(StatusCode::OK, r#"{"status":"degraded"}"#, Duration::ZERO).await;
        let (registry, prober) = setup(server.url(), RegistryConfig::default()).await;

        let health = prober.perform_health_check("pricing", "i1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(
            registry.get_instance("pricing", "i1").await.unwrap().status,
            InstanceStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_body_status_ignored_when_untrusted() {
        let server =
            spawn_health_server(StatusCode::OK, r#"{"status":"unhealthy"}"#, Duration::ZERO).await;
        let config = RegistryConfig {
            trust_body_status: false,
            ..Default::default()
        };
        let (_, prober) = setup(server.url(), config).await;

        let health = prober.perform_health_check("pricing", "i1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_non_2xx_is_unhealthy() {
        let server = spawn_health_server(StatusCode::NOT_FOUND, "missing", Duration::ZERO).await;
        let (registry, prober) = setup(server.url(), RegistryConfig::default()).await;

        let health = prober.perform_health_check("pricing", "i1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.details["error"], "HTTP 404");
        assert!(registry.get_healthy_instances("pricing").await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_json_is_unhealthy() {
        let server = spawn_health_server(StatusCode::OK, "<html>ok</html>", Duration::ZERO).await;
        let (_, prober) = setup(server.url(), RegistryConfig::default()).await;

        let health = prober.perform_health_check("pricing", "i1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        let error = health.details["error"].as_str().unwrap();
        assert!(error.starts_with("Invalid health response"));
    }

    #[tokio::test]
    async fn test_oversized_body_is_unhealthy() {
        let body: &'static str = Box::leak(" ".repeat(MAX_BODY_BYTES + 1).into_boxed_str());
        let server = spawn_health_server(StatusCode::OK, body, Duration::ZERO).await;
        let (registry, prober) = setup(server.url(), RegistryConfig::default()).await;

        let health = prober.perform_health_check("pricing", "i1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(
            health.details["error"],
            format!("Health response exceeds {} bytes", MAX_BODY_BYTES)
        );
        assert!(registry.get_healthy_instances("pricing").await.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_unhealthy() {
        let server = spawn_health_server(
            StatusCode::OK,
            r#"{"status":"healthy"}"#,
            Duration::from_secs(2),
        )
        .await;
        let config = RegistryConfig {
            probe_timeout_ms: 100,
            ..Default::default()
        };
        let (registry, prober) = setup(server.url(), config).await;

        let health = prober.perform_health_check("pricing", "i1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.details["error"], "Health check timed out after 100ms");
        assert!(health.response_time < 2000);

        let cached = registry.get_service_health("pricing", "i1").await.unwrap();
        assert_eq!(cached, health);
        assert!(registry.get_healthy_instances("pricing").await.is_empty());
    }

    #[tokio::test]
    async fn test_connection_refused_is_unhealthy() {
        let endpoint = format!("http://{}", closed_port().await);
        let (registry, prober) = setup(endpoint, RegistryConfig::default()).await;

        let health = prober.perform_health_check("pricing", "i1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.details.contains_key("error"));
        assert!(registry.get_service_health("pricing", "i1").await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let (_, prober) = setup("http://127.0.0.1:1".to_string(), RegistryConfig::default()).await;

        let result = prober.perform_health_check("pricing", "i9").await;
        assert!(matches!(result, Err(RegistryError::InstanceNotFound { .. })));
        let result = prober.perform_health_check("billing", "i1").await;
        assert!(matches!(result, Err(RegistryError::InstanceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_probe_counts_metrics() {
        let server = spawn_health_server(StatusCode::OK, "{}", Duration::ZERO).await;
        let (_, prober) = setup(server.url(), RegistryConfig::default()).await;

        prober.perform_health_check("pricing", "i1").await.unwrap();
        assert_eq!(
            prober.metrics.probes_total.with_label_values(&["healthy"]).get(),
            1.0
        );
    }
}
