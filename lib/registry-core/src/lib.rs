//! Core service registry functionality
//!
//! This library provides:
//! - Data model for service definitions, instances and health records
//! - Service registry with capability discovery and health-aware instance lookup
//! - Persistence gateway trait with an in-memory implementation
//! - Registry configuration

pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod store;

pub use config::RegistryConfig;
pub use error::{RegistryError, Result, StoreError};
pub use model::{
    HealthStatus, InstanceStatus, ServiceBreakdown, ServiceDefinition, ServiceHealth,
    ServiceInstance, ServiceStatistics,
};
pub use registry::ServiceRegistry;
pub use store::{MemoryStore, RegistryStore, ServiceRecordStatus};
