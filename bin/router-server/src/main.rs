use anyhow::{Context, Result};
use router_core::{RegistryRouter, RouterOptions};
use router_registry::MemoryRegistry;
use router_rpc::RouterServer;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

mod config;

use config::ServerConfig;

/// Set to `json` for JSON log lines
const LOG_FORMAT_ENV: &str = "ROUTER_LOG_FORMAT";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting router-server...");

    let config = ServerConfig::load().context("failed to load configuration")?;

    // Seed the registry with the configured services
    let registry = MemoryRegistry::new();
    for svc in &config.services {
        registry
            .register(svc.service.clone(), &svc.domain)
            .await
            .with_context(|| format!("failed to register service {}", svc.service.name))?;
    }
    info!(
        "Memory registry initialized with {} services",
        registry.service_count().await
    );

    let router = RegistryRouter::new(RouterOptions::new(
        config.router.clone(),
        Arc::new(registry),
    ))
    .await
    .context("failed to create router")?;
    let options = router.options().await;
    info!(
        "Router {} initialized (network: {}, cache: {})",
        options.config.id, options.config.network, options.config.cache
    );
    if let Some(gateway) = &options.config.gateway {
        info!("  - Default gateway: {}", gateway);
    }

    let server = RouterServer::bind(config.address, router.clone()).await?;
    info!("HTTP server listening on {}", server.local_addr()?);

    server.serve(shutdown_signal()).await?;

    router.close().await?;
    info!("router-server stopped");
    Ok(())
}

fn init_tracing() {
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_filter(filter()).boxed()
    };

    tracing_subscriber::registry().with(layer).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
