//! Persistence gateway for registry records
//!
//! The registry keeps its authoritative view in memory and forwards every
//! write through a [`RegistryStore`]. [`MemoryStore`] backs the daemon and
//! the tests; a database-backed gateway implements the same trait.

use crate::model::{ServiceDefinition, ServiceHealth, ServiceInstance};
use crate::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Durable status of a service record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRecordStatus {
    Active,
    Inactive,
}

/// Durable store for services, instances and the health history
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Upsert a service record keyed by service id
    async fn upsert_service(
        &self,
        service: &ServiceDefinition,
        status: ServiceRecordStatus,
    ) -> Result<(), StoreError>;

    /// Upsert an instance record keyed by (service_id, instance_id)
    async fn upsert_instance(&self, instance: &ServiceInstance) -> Result<(), StoreError>;

    /// Append one health record to the history
    async fn append_health(&self, health: &ServiceHealth) -> Result<(), StoreError>;

    /// Services whose record status is active
    async fn load_active_services(&self) -> Result<Vec<ServiceDefinition>, StoreError>;

    /// Instances whose status is healthy, unhealthy or starting
    async fn load_live_instances(&self) -> Result<Vec<ServiceInstance>, StoreError>;
}

/// Durable copy of a service definition
#[derive(Clone, Debug)]
pub struct ServiceRecord {
    pub definition: ServiceDefinition,
    pub status: ServiceRecordStatus,
    pub updated_at: DateTime<Utc>,
}

/// Durable copy of an instance
#[derive(Clone, Debug)]
pub struct InstanceRecord {
    pub instance: ServiceInstance,
    pub updated_at: DateTime<Utc>,
}

/// In-process [`RegistryStore`]
#[derive(Clone, Default)]
pub struct MemoryStore {
    services: Arc<RwLock<HashMap<String, ServiceRecord>>>,
    // (service_id, instance_id) to record
    instances: Arc<RwLock<HashMap<(String, String), InstanceRecord>>>,
    health: Arc<RwLock<Vec<ServiceHealth>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durable copy of a service, if it was ever written
    pub async fn service_record(&self, service_id: &str) -> Option<ServiceRecord> {
        let services = self.services.read().await;
        services.get(service_id).cloned()
    }

    /// Last durable copy of an instance, including soft-deleted ones
    pub async fn instance_record(&self, service_id: &str, instance_id: &str) -> Option<InstanceRecord> {
        let instances = self.instances.read().await;
        instances
            .get(&(service_id.to_string(), instance_id.to_string()))
            .cloned()
    }

    /// Every stored health record for an instance, oldest first
    pub async fn health_history(&self, service_id: &str, instance_id: &str) -> Vec<ServiceHealth> {
        let health = self.health.read().await;
        health
            .iter()
            .filter(|h| h.service_id == service_id && h.instance_id == instance_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn upsert_service(
        &self,
        service: &ServiceDefinition,
        status: ServiceRecordStatus,
    ) -> Result<(), StoreError> {
        let mut services = self.services.write().await;
        services.insert(
            service.id.clone(),
            ServiceRecord {
                definition: service.clone(),
                status,
                updated_at: Utc::now(),
            },
        );
        debug!("Stored service record: {} ({:?})", service.id, status);
        Ok(())
    }

    async fn upsert_instance(&self, instance: &ServiceInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        instances.insert(
            (instance.service_id.clone(), instance.instance_id.clone()),
            InstanceRecord {
                instance: instance.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn append_health(&self, health: &ServiceHealth) -> Result<(), StoreError> {
        self.health.write().await.push(health.clone());
        Ok(())
    }

    async fn load_active_services(&self) -> Result<Vec<ServiceDefinition>, StoreError> {
        let services = self.services.read().await;
        Ok(services
            .values()
            .filter(|record| record.status == ServiceRecordStatus::Active)
            .map(|record| record.definition.clone())
            .collect())
    }

    async fn load_live_instances(&self) -> Result<Vec<ServiceInstance>, StoreError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|record| record.instance.status.is_live())
            .map(|record| record.instance.clone())
            .collect())
    }
}
