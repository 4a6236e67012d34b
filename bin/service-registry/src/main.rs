use anyhow::Result;
use registry_core::{MemoryStore, RegistryStore};
use registry_health::RegistryRuntime;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod admin;
mod config;
mod seed;

use config::DaemonConfig;
use seed::SeedManifest;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting service-registry daemon...");

    let config = DaemonConfig::load()?;

    // Durable backends implement RegistryStore; the daemon keeps records in process
    let store: Arc<dyn RegistryStore> = Arc::new(MemoryStore::new());
    let runtime = Arc::new(RegistryRuntime::new(store, config.registry.clone())?);
    runtime.initialize().await;
    info!("Service registry initialized");

    if let Some(path) = &config.seed_file {
        let manifest = SeedManifest::from_file(path)?;
        let (services, instances) = manifest.apply(runtime.registry()).await?;
        info!(
            "Seeded {} services and {} instances from {}",
            services,
            instances,
            path.display()
        );
    }

    runtime.start_heartbeat_monitoring().await;

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("Admin endpoint listening on {}", config.listen_addr);
    let server = tokio::spawn(admin::serve(listener, runtime.clone()));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(config.registry.heartbeat_interval());

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Error waiting for shutdown signal: {}", e);
                }
                break;
            }
            _ = ticker.tick() => {
                let stats = runtime.registry().get_service_statistics().await;
                info!(
                    "Registry has {} services, {} instances ({} healthy, {} unhealthy)",
                    stats.total_services,
                    stats.total_instances,
                    stats.healthy_instances,
                    stats.unhealthy_instances
                );
            }
        }
    }

    info!("Shutting down service-registry...");
    server.abort();
    runtime.cleanup().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("REGISTRY_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
