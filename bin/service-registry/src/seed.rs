//! Startup manifest of services and instances

use anyhow::{Context, Result};
use registry_core::{ServiceDefinition, ServiceInstance, ServiceRegistry};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SeedManifest {
    pub services: Vec<ServiceDefinition>,
    pub instances: Vec<ServiceInstance>,
}

impl SeedManifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse seed file {}", path.display()))
    }

    /// Register every service, then every instance. Stops at the first failure.
    pub async fn apply(self, registry: &ServiceRegistry) -> Result<(usize, usize)> {
        let service_count = self.services.len();
        let instance_count = self.instances.len();

        for service in self.services {
            debug!("Seeding service {}", service.id);
            let id = service.id.clone();
            registry
                .register_service(service)
                .await
                .with_context(|| format!("Failed to seed service {}", id))?;
        }
        for instance in self.instances {
            let key = instance.health_key();
            registry
                .register_instance(instance)
                .await
                .with_context(|| format!("Failed to seed instance {}", key))?;
        }

        Ok((service_count, instance_count))
    }
}
