//! Daemon configuration: optional YAML file plus environment overrides

use anyhow::{Context, Result};
use registry_core::RegistryConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Path of the YAML configuration file
pub const CONFIG_ENV: &str = "REGISTRY_CONFIG";
pub const LISTEN_ADDR_ENV: &str = "REGISTRY_LISTEN_ADDR";
pub const SEED_FILE_ENV: &str = "REGISTRY_SEED_FILE";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address of the admin HTTP endpoint
    pub listen_addr: SocketAddr,
    /// Manifest of services and instances registered at startup
    pub seed_file: Option<PathBuf>,
    pub registry: RegistryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8500).into(),
            seed_file: None,
            registry: RegistryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from `REGISTRY_CONFIG` if set, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.registry.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(LISTEN_ADDR_ENV) {
            self.listen_addr = addr
                .parse()
                .with_context(|| format!("Invalid {}: {}", LISTEN_ADDR_ENV, addr))?;
        }
        if let Some(path) = lookup(SEED_FILE_ENV) {
            self.seed_file = Some(PathBuf::from(path));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_addr.port(), 8500);
        assert!(config.seed_file.is_none());
        assert_eq!(config.registry.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_yaml_config() {
        let config = DaemonConfig::from_yaml(
            "listen_addr: 127.0.0.1:9000\nregistry:\n  heartbeat_interval_ms: 10000\n",
        )
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.registry.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.registry.probe_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (LISTEN_ADDR_ENV, "127.0.0.1:7000"),
            (SEED_FILE_ENV, "/etc/registry/seed.yaml"),
        ]
        .into_iter()
        .collect();

        let mut config = DaemonConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.listen_addr.port(), 7000);
        assert_eq!(
            config.seed_file.as_deref(),
            Some(Path::new("/etc/registry/seed.yaml"))
        );
    }

    #[test]
    fn test_invalid_listen_addr() {
        let mut config = DaemonConfig::default();
        let result = config.apply_overrides(|key| {
            (key == LISTEN_ADDR_ENV).then(|| "not-an-address".to_string())
        });
        assert!(result.is_err());
    }
}
