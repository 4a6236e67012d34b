use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors raised by a persistence gateway
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Instance not found: {service_id}/{instance_id}")]
    InstanceNotFound {
        service_id: String,
        instance_id: String,
    },

    #[error("Revision conflict on {service_id}/{instance_id}: expected {expected}, found {actual}")]
    RevisionConflict {
        service_id: String,
        instance_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Invalid registry configuration: {0}")]
    InvalidConfiguration(String),
}

impl RegistryError {
    pub(crate) fn instance_not_found(service_id: &str, instance_id: &str) -> Self {
        RegistryError::InstanceNotFound {
            service_id: service_id.to_string(),
            instance_id: instance_id.to_string(),
        }
    }

    /// Whether the error came from the persistence gateway
    pub fn is_persistence(&self) -> bool {
        matches!(self, RegistryError::Persistence(_))
    }
}
