//! consul-proxy
//!
//! Dynamic TCP proxy for Consul services.
//!
//! This service:
//! - Locates the Consul HTTP API (static override or DNS SRV)
//! - Polls the health API for passing instances of each service
//! - Accepts TCP connections on one local listener per service
//! - Pipes each connection to the service's first healthy instance

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use consul_proxy::cli::Cli;
use consul_proxy::{
    ConsulHealthQuerier, DiscoveryBackendResolver, EndpointDirectory, ProxyEngine, ServiceQuerier,
    BUILD,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = BUILD,
        "Starting consul-proxy"
    );

    let config = cli.resolve()?;
    info!(
        config = %config,
        poll_interval_secs = config.poll_interval().as_secs(),
        proxy_count = config.proxies.len(),
        "Configuration loaded"
    );

    let backend = Arc::new(config.discovery.clone());
    let querier: Arc<dyn ServiceQuerier> = Arc::new(ConsulHealthQuerier::new()?);

    let mut proxies = JoinSet::new();

    for spec in config.proxies.clone() {
        let directory = Arc::new(
            EndpointDirectory::new(
                spec.service_name.clone(),
                spec.partition.clone(),
                Arc::new(DiscoveryBackendResolver::new(Arc::clone(&backend))),
                Arc::clone(&querier),
            )
            .with_poll_interval(config.poll_interval()),
        );

        proxies.spawn(async move {
            info!(proxy = %spec, "Starting proxy");
            // Blocks until the first non-empty endpoint set is published
            let _refresh = directory.start().await;

            if let Err(e) = ProxyEngine::start(spec.clone(), directory).await {
                error!(
                    proxy = %spec,
                    reason = e.reason_code(),
                    error = %e,
                    "Proxy stopped"
                );
            }
        });
    }

    while let Some(result) = proxies.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Proxy task panicked");
        }
    }

    info!("All proxies stopped");
    Ok(())
}
