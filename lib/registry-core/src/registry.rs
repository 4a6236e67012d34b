//! Service registry: services, their instances and the latest health per instance

use crate::config::RegistryConfig;
use crate::model::{
    health_key, HealthStatus, InstanceStatus, ServiceBreakdown, ServiceDefinition, ServiceHealth,
    ServiceInstance, ServiceStatistics,
};
use crate::store::{RegistryStore, ServiceRecordStatus};
use crate::{RegistryError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// ServiceRegistry is the authoritative in-memory view of services and instances.
///
/// Every write is forwarded to a [`RegistryStore`]. Discovery and statistics
/// are answered from memory only, so the registry keeps serving lookups while
/// the store is degraded.
///
/// Locks are always taken in the order services, instances, health, and are
/// never held across a store call. Writes that reach the store queue on a
/// separate write gate instead, so the store sees them in the same order as
/// memory while readers keep going.
pub struct ServiceRegistry {
    // service id to definition
    services: Arc<RwLock<HashMap<String, ServiceDefinition>>>,
    // service id to its instances
    instances: Arc<RwLock<HashMap<String, Vec<ServiceInstance>>>>,
    // "service_id/instance_id" to the latest health record
    health: Arc<RwLock<HashMap<String, ServiceHealth>>>,
    // serializes service and instance writes across their store calls
    writes: Mutex<()>,
    store: Arc<dyn RegistryStore>,
    config: RegistryConfig,
}

impl ServiceRegistry {
    /// Create an empty registry; fails if `config` does not validate
    pub fn new(store: Arc<dyn RegistryStore>, config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            health: Arc::new(RwLock::new(HashMap::new())),
            writes: Mutex::new(()),
            store,
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Populate the in-memory view from the store
    pub async fn initialize(&self) {
        self.load_services_from_store().await;
    }

    /// Replace the in-memory view with active services and live instances from the store.
    ///
    /// Store failures are logged and leave the registry empty.
    pub async fn load_services_from_store(&self) {
        let definitions = match self.store.load_active_services().await {
            Ok(definitions) => definitions,
            Err(e) => {
                warn!("Failed to load services from store, starting empty: {}", e);
                return;
            }
        };
        let loaded_instances = match self.store.load_live_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("Failed to load instances from store, starting empty: {}", e);
                return;
            }
        };

        let mut services = self.services.write().await;
        let mut instances = self.instances.write().await;
        services.clear();
        instances.clear();

        for definition in definitions {
            services.insert(definition.id.clone(), definition);
        }

        let mut instance_count = 0;
        for instance in loaded_instances {
            if !services.contains_key(&instance.service_id) {
                warn!(
                    "Skipping stored instance {} of unknown service {}",
                    instance.instance_id, instance.service_id
                );
                continue;
            }
            instances
                .entry(instance.service_id.clone())
                .or_default()
                .push(instance);
            instance_count += 1;
        }

        info!(
            "Loaded {} services and {} instances from store",
            services.len(),
            instance_count
        );
    }

    /// Register or replace a service definition.
    ///
    /// The durable write happens first; on failure the in-memory view is untouched.
    pub async fn register_service(&self, definition: ServiceDefinition) -> Result<()> {
        let _gate = self.writes.lock().await;
        self.store
            .upsert_service(&definition, ServiceRecordStatus::Active)
            .await?;

        debug!("Registered service: {}", definition.id);
        self.services
            .write()
            .await
            .insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Remove a service together with its instances and their cached health.
    ///
    /// The in-memory removal always happens; store failures are reported afterwards.
    pub async fn deregister_service(&self, service_id: &str) -> Result<ServiceDefinition> {
        let _gate = self.writes.lock().await;
        let (definition, removed) = {
            let mut services = self.services.write().await;
            let definition = services
                .remove(service_id)
                .ok_or_else(|| RegistryError::ServiceNotFound(service_id.to_string()))?;
            let mut instances = self.instances.write().await;
            let removed = instances.remove(service_id).unwrap_or_default();
            let mut health = self.health.write().await;
            health.retain(|_, record| record.service_id != service_id);
            (definition, removed)
        };

        info!(
            "Deregistered service {} with {} instances",
            service_id,
            removed.len()
        );

        let mut first_error = None;
        if let Err(e) = self
            .store
            .upsert_service(&definition, ServiceRecordStatus::Inactive)
            .await
        {
            warn!("Failed to persist deregistration of service {}: {}", service_id, e);
            first_error = Some(e);
        }
        for mut instance in removed {
            instance.status = InstanceStatus::Stopping;
            instance.revision += 1;
            if let Err(e) = self.store.upsert_instance(&instance).await {
                warn!(
                    "Failed to persist stopping status for {}: {}",
                    instance.health_key(),
                    e
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(definition),
        }
    }

    /// Register or replace an instance, matched by instance id within its service.
    ///
    /// The service must already be registered. Returns the stored copy with its
    /// new revision; on a store failure nothing changes in memory. A newly added
    /// instance starts without cached health, so it is not discoverable until
    /// its first healthy probe.
    pub async fn register_instance(&self, mut instance: ServiceInstance) -> Result<ServiceInstance> {
        let _gate = self.writes.lock().await;
        if self.get_service(&instance.service_id).await.is_none() {
            return Err(RegistryError::ServiceNotFound(instance.service_id.clone()));
        }

        let existing = self
            .get_instance(&instance.service_id, &instance.instance_id)
            .await
            .map(|i| (i.id, i.revision));

        match existing {
            Some((id, revision)) => {
                if instance.id.is_empty() {
                    instance.id = id;
                }
                instance.revision = revision + 1;
            }
            None => {
                if instance.id.is_empty() {
                    instance.id = Uuid::new_v4().to_string();
                }
                instance.revision = 1;
            }
        }

        self.store.upsert_instance(&instance).await?;

        {
            let mut instances = self.instances.write().await;
            let list = instances.entry(instance.service_id.clone()).or_default();
            match list.iter_mut().find(|i| i.instance_id == instance.instance_id) {
                Some(slot) => *slot = instance.clone(),
                None => {
                    list.push(instance.clone());
                    self.health.write().await.remove(&instance.health_key());
                }
            }
        }

        debug!(
            "Registered instance {} ({}, revision {})",
            instance.health_key(),
            instance.status.as_str(),
            instance.revision
        );
        Ok(instance)
    }

    /// Remove an instance from the live view and soft-delete it in the store.
    ///
    /// The removal always succeeds once the instance is found; a failed
    /// `stopping` write is returned as [`RegistryError::Persistence`].
    pub async fn deregister_instance(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> Result<ServiceInstance> {
        let _gate = self.writes.lock().await;
        let mut removed = {
            let mut instances = self.instances.write().await;
            let list = instances
                .get_mut(service_id)
                .ok_or_else(|| RegistryError::instance_not_found(service_id, instance_id))?;
            let position = list
                .iter()
                .position(|i| i.instance_id == instance_id)
                .ok_or_else(|| RegistryError::instance_not_found(service_id, instance_id))?;
            list.remove(position)
        };
        self.health
            .write()
            .await
            .remove(&health_key(service_id, instance_id));

        removed.status = InstanceStatus::Stopping;
        removed.revision += 1;
        debug!("Deregistered instance {}", removed.health_key());

        if let Err(e) = self.store.upsert_instance(&removed).await {
            warn!(
                "Failed to persist stopping status for {}: {}",
                removed.health_key(),
                e
            );
            return Err(e.into());
        }
        Ok(removed)
    }

    /// Refresh an instance's heartbeat on its own liveness signal
    pub async fn record_heartbeat(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> Result<ServiceInstance> {
        let now = Utc::now();
        self.write_instance(service_id, instance_id, None, |instance| {
            instance.last_heartbeat = now;
        })
        .await
    }

    /// Set an instance's status if its revision still matches `expected_revision`
    pub async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        expected_revision: u64,
        status: InstanceStatus,
    ) -> Result<ServiceInstance> {
        self.write_instance(service_id, instance_id, Some(expected_revision), |instance| {
            instance.status = status;
        })
        .await
    }

    /// Apply `update` to a copy of the instance, persist it, then swap it in.
    ///
    /// The copy is built under a short read lock and swapped in under a short
    /// write lock, so readers never wait on the store. The revision check
    /// catches writers that read before us. Heartbeats refreshed in memory
    /// while the store call was in flight are kept.
    async fn write_instance<F>(
        &self,
        service_id: &str,
        instance_id: &str,
        expected_revision: Option<u64>,
        update: F,
    ) -> Result<ServiceInstance>
    where
        F: FnOnce(&mut ServiceInstance),
    {
        let _gate = self.writes.lock().await;
        let current = self
            .get_instance(service_id, instance_id)
            .await
            .ok_or_else(|| RegistryError::instance_not_found(service_id, instance_id))?;

        if let Some(expected) = expected_revision {
            if current.revision != expected {
                return Err(RegistryError::RevisionConflict {
                    service_id: service_id.to_string(),
                    instance_id: instance_id.to_string(),
                    expected,
                    actual: current.revision,
                });
            }
        }

        let mut updated = current.clone();
        update(&mut updated);
        updated.revision += 1;

        self.store.upsert_instance(&updated).await?;

        let mut instances = self.instances.write().await;
        let slot = instances
            .get_mut(service_id)
            .and_then(|list| list.iter_mut().find(|i| i.instance_id == instance_id))
            .ok_or_else(|| RegistryError::instance_not_found(service_id, instance_id))?;
        if slot.revision != current.revision {
            return Err(RegistryError::RevisionConflict {
                service_id: service_id.to_string(),
                instance_id: instance_id.to_string(),
                expected: current.revision,
                actual: slot.revision,
            });
        }
        if slot.last_heartbeat > updated.last_heartbeat {
            updated.last_heartbeat = slot.last_heartbeat;
        }
        *slot = updated.clone();
        Ok(updated)
    }

    /// Record the result of a probe.
    ///
    /// The record replaces the cached one while the instance is registered;
    /// results for instances that have left are only appended to the history.
    /// A healthy result counts as a heartbeat, and a status change is written
    /// back through the revision-checked path. A failed history append is
    /// reported after the cache is updated.
    pub async fn update_service_health(&self, health: ServiceHealth) -> Result<()> {
        {
            let instances = self.instances.read().await;
            let present = instances
                .get(&health.service_id)
                .is_some_and(|list| list.iter().any(|i| i.instance_id == health.instance_id));
            if present {
                self.health
                    .write()
                    .await
                    .insert(health.key(), health.clone());
            } else {
                debug!("Not caching health of departed instance {}", health.key());
            }
        }

        let appended = self.store.append_health(&health).await;
        if let Err(e) = &appended {
            warn!("Failed to persist health record for {}: {}", health.key(), e);
        }

        if health.status == HealthStatus::Healthy {
            self.refresh_heartbeat(&health.service_id, &health.instance_id, health.timestamp)
                .await;
        }

        self.sync_instance_status(&health).await?;
        appended.map_err(RegistryError::from)
    }

    async fn refresh_heartbeat(&self, service_id: &str, instance_id: &str, at: DateTime<Utc>) {
        let mut instances = self.instances.write().await;
        if let Some(instance) = instances
            .get_mut(service_id)
            .and_then(|list| list.iter_mut().find(|i| i.instance_id == instance_id))
        {
            if at > instance.last_heartbeat {
                instance.last_heartbeat = at;
            }
        }
    }

    async fn sync_instance_status(&self, health: &ServiceHealth) -> Result<()> {
        let target = health.status.instance_status();
        let mut last_conflict = None;

        for attempt in 1..=self.config.revision_retries {
            let Some(current) = self
                .get_instance(&health.service_id, &health.instance_id)
                .await
            else {
                debug!(
                    "Instance {} left the registry before its health was applied",
                    health.key()
                );
                return Ok(());
            };
            if current.status == target {
                return Ok(());
            }

            match self
                .update_instance_status(
                    &health.service_id,
                    &health.instance_id,
                    current.revision,
                    target,
                )
                .await
            {
                Ok(_) => {
                    info!(
                        "Instance {} changed status: {} -> {}",
                        health.key(),
                        current.status.as_str(),
                        target.as_str()
                    );
                    return Ok(());
                }
                Err(e @ RegistryError::RevisionConflict { .. }) => {
                    debug!("Status write attempt {} lost a race: {}", attempt, e);
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_conflict {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Get a service definition
    pub async fn get_service(&self, service_id: &str) -> Option<ServiceDefinition> {
        let services = self.services.read().await;
        services.get(service_id).cloned()
    }

    /// All service definitions, ordered by id
    pub async fn get_all_services(&self) -> Vec<ServiceDefinition> {
        let services = self.services.read().await;
        let mut all: Vec<ServiceDefinition> = services.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Get a single instance
    pub async fn get_instance(&self, service_id: &str, instance_id: &str) -> Option<ServiceInstance> {
        let instances = self.instances.read().await;
        instances
            .get(service_id)
            .and_then(|list| list.iter().find(|i| i.instance_id == instance_id))
            .cloned()
    }

    /// Every instance of a service, whatever its status
    pub async fn get_instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        let instances = self.instances.read().await;
        instances.get(service_id).cloned().unwrap_or_default()
    }

    /// Latest cached health record of an instance
    pub async fn get_service_health(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> Option<ServiceHealth> {
        let health = self.health.read().await;
        health.get(&health_key(service_id, instance_id)).cloned()
    }

    /// Services advertising `capability` (exact, case-sensitive match), ordered by id
    pub async fn discover_services(&self, capability: &str) -> Vec<ServiceDefinition> {
        let services = self.services.read().await;
        let mut matching: Vec<ServiceDefinition> = services
            .values()
            .filter(|s| s.has_capability(capability))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));

        debug!(
            "Capability {} matched {} services",
            capability,
            matching.len()
        );
        matching
    }

    /// Snapshot of the instances of a service that are safe to route to.
    ///
    /// An instance qualifies when its status is healthy, its latest probe was
    /// healthy and its heartbeat is younger than the staleness window.
    pub async fn get_healthy_instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        let now = Utc::now();
        let window = self.config.staleness_window();
        let instances = self.instances.read().await;
        let health = self.health.read().await;

        instances
            .get(service_id)
            .map(|list| {
                list.iter()
                    .filter(|i| is_discoverable(i, health.get(&i.health_key()), now, window))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// (service_id, instance_id) of every instance the heartbeat sweep should probe
    pub async fn probe_targets(&self) -> Vec<(String, String)> {
        let instances = self.instances.read().await;
        instances
            .values()
            .flatten()
            .filter(|i| i.status.is_probe_eligible())
            .map(|i| (i.service_id.clone(), i.instance_id.clone()))
            .collect()
    }

    /// Aggregate counts recomputed from the current in-memory state
    pub async fn get_service_statistics(&self) -> ServiceStatistics {
        let services = self.services.read().await;
        let instances = self.instances.read().await;

        let mut stats = ServiceStatistics {
            total_services: services.len(),
            total_instances: instances.values().map(Vec::len).sum(),
            ..Default::default()
        };

        for (service_id, definition) in services.iter() {
            let list = instances.get(service_id).map(Vec::as_slice).unwrap_or(&[]);
            let healthy = count_status(list, InstanceStatus::Healthy);
            let unhealthy = count_status(list, InstanceStatus::Unhealthy);
            let health_rate = if list.is_empty() {
                0.0
            } else {
                healthy as f64 / list.len() as f64 * 100.0
            };

            stats.healthy_instances += healthy;
            stats.unhealthy_instances += unhealthy;
            stats.service_breakdown.insert(
                service_id.clone(),
                ServiceBreakdown {
                    name: definition.name.clone(),
                    total: list.len(),
                    healthy,
                    unhealthy,
                    health_rate,
                },
            );
        }

        stats
    }

    /// Drop every service, instance and cached health record from memory
    pub async fn clear(&self) {
        let mut services = self.services.write().await;
        let mut instances = self.instances.write().await;
        let mut health = self.health.write().await;
        services.clear();
        instances.clear();
        health.clear();
        debug!("Cleared registry state");
    }

    /// Get count of registered services
    pub async fn service_count(&self) -> usize {
        self.services.read().await.len()
    }
}

fn count_status(instances: &[ServiceInstance], status: InstanceStatus) -> usize {
    instances.iter().filter(|i| i.status == status).count()
}

fn is_discoverable(
    instance: &ServiceInstance,
    latest: Option<&ServiceHealth>,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> bool {
    instance.status == InstanceStatus::Healthy
        && latest.is_some_and(|h| h.status == HealthStatus::Healthy)
        && now.signed_duration_since(instance.last_heartbeat) < window
}
