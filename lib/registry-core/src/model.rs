//! Registry data model: service definitions, instances and health records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Static description of a logical service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub endpoint: String,
    /// Path appended to an instance endpoint to form its probe URL
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Ids of services this one depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

impl ServiceDefinition {
    /// Create a definition with the default `/health` probe path
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: String::new(),
            endpoint: String::new(),
            health_endpoint: default_health_endpoint(),
            capabilities: BTreeSet::new(),
            dependencies: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_health_endpoint(mut self, path: impl Into<String>) -> Self {
        self.health_endpoint = path.into();
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Lifecycle status of a running instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
}

impl InstanceStatus {
    /// Instances the heartbeat sweep probes
    pub fn is_probe_eligible(self) -> bool {
        matches!(self, InstanceStatus::Healthy | InstanceStatus::Unhealthy)
    }

    /// Instances restored from the store at bootstrap
    pub fn is_live(self) -> bool {
        !matches!(self, InstanceStatus::Stopping)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Stopping => "stopping",
        }
    }
}

/// One running replica of a service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Record id, assigned on first registration when empty
    #[serde(default)]
    pub id: String,
    pub service_id: String,
    pub instance_id: String,
    pub endpoint: String,
    pub status: InstanceStatus,
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Bumped by the registry on every write
    #[serde(default)]
    pub revision: u64,
}

impl ServiceInstance {
    pub fn new(
        service_id: impl Into<String>,
        instance_id: impl Into<String>,
        endpoint: impl Into<String>,
        status: InstanceStatus,
    ) -> Self {
        Self {
            id: String::new(),
            service_id: service_id.into(),
            instance_id: instance_id.into(),
            endpoint: endpoint.into(),
            status,
            last_heartbeat: Utc::now(),
            metadata: HashMap::new(),
            revision: 0,
        }
    }

    /// Key of the instance's cached health record
    pub fn health_key(&self) -> String {
        health_key(&self.service_id, &self.instance_id)
    }
}

/// Key under which the latest health record of an instance is cached
pub fn health_key(service_id: &str, instance_id: &str) -> String {
    format!("{}/{}", service_id, instance_id)
}

/// Outcome of a single health probe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

impl HealthStatus {
    /// Instance status implied by a probe result; anything not healthy is unhealthy
    pub fn instance_status(self) -> InstanceStatus {
        match self {
            HealthStatus::Healthy => InstanceStatus::Healthy,
            HealthStatus::Unhealthy | HealthStatus::Degraded => InstanceStatus::Unhealthy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Degraded => "degraded",
        }
    }
}

/// Result of one probe of one instance. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_id: String,
    pub instance_id: String,
    pub status: HealthStatus,
    /// Probe round trip in milliseconds
    pub response_time: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl ServiceHealth {
    pub fn key(&self) -> String {
        health_key(&self.service_id, &self.instance_id)
    }
}

/// Per-service slice of the statistics snapshot
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ServiceBreakdown {
    pub name: String,
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// healthy / total * 100, zero for a service with no instances
    pub health_rate: f64,
}

/// Aggregate counts recomputed from the in-memory view on every call
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ServiceStatistics {
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub service_breakdown: BTreeMap<String, ServiceBreakdown>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_collapses_to_unhealthy() {
        assert_eq!(HealthStatus::Healthy.instance_status(), InstanceStatus::Healthy);
        assert_eq!(HealthStatus::Unhealthy.instance_status(), InstanceStatus::Unhealthy);
        assert_eq!(HealthStatus::Degraded.instance_status(), InstanceStatus::Unhealthy);
    }

    #[test]
    fn test_probe_eligibility() {
        assert!(InstanceStatus::Healthy.is_probe_eligible());
        assert!(InstanceStatus::Unhealthy.is_probe_eligible());
        assert!(!InstanceStatus::Starting.is_probe_eligible());
        assert!(!InstanceStatus::Stopping.is_probe_eligible());
    }

    #[test]
    fn test_service_definition_defaults_from_yaml() {
        let def: ServiceDefinition = serde_yaml::from_str(
            "id: pricing\nname: Pricing\ncapabilities: [quote]\n",
        )
        .unwrap();
        assert_eq!(def.health_endpoint, "/health");
        assert!(def.has_capability("quote"));
        assert!(!def.has_capability("Quote"));
        assert!(def.dependencies.is_empty());
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&InstanceStatus::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");
        let status: HealthStatus = serde_json::from_str("\"degraded\"").unwrap();
        assert_eq!(status, HealthStatus::Degraded);
    }
}
