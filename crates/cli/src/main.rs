//! musterd: single-process control plane over the in-memory backend.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use muster_facade::Facade;
use muster_index::IndexService;
use muster_node::NodeService;
use muster_store::MemBackend;
use muster_sync::{InProcLink, NoopPopulator, SyncService};
use muster_task::{register_namespace_cleanup, ExpiryJob, Registry, TaskConfig, TaskManager};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "musterd", version, about = "Muster fleet control plane")]
struct Cli {
    /// Seconds between expiry cron runs
    #[arg(long = "expiry-every", env = "MUSTER_EXPIRY_SECS", default_value_t = 60)]
    expiry_every: u64,
}

fn init_tracing() {
    let env = std::env::var("MUSTER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MUSTER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MUSTER_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let be = Arc::new(MemBackend::new());
    let index = IndexService::new(be.clone());
    let nodes = NodeService::new(be.clone(), be.clone(), be.clone(), be.clone(), index.clone());
    let facade = Facade::new(
        be.clone(),
        be.clone(),
        be.clone(),
        be.clone(),
        be.clone(),
        index.clone(),
        nodes.clone(),
    );
    let sync = SyncService::new(
        be.clone(),
        be.clone(),
        be.clone(),
        be.clone(),
        nodes.clone(),
        Arc::new(NoopPopulator),
    );
    // The node-facing transport plugs in here; in-process for now.
    let _link = InProcLink::new(sync);

    let registry = Arc::new(Registry::new());
    register_namespace_cleanup(&registry, facade, nodes.clone())?;

    let config = TaskConfig::from_env();
    let lock_ttl = config.lock_ttl_secs;
    let manager = Arc::new(TaskManager::new(be.clone(), registry, config)).start();

    let (close_tx, close_rx) = watch::channel(false);
    let expiry = Arc::new(ExpiryJob::new(
        be.clone(),
        be.clone(),
        be.clone(),
        nodes,
        index,
        lock_ttl,
    ));
    let cron = expiry.spawn(Duration::from_secs(cli.expiry_every.max(1)), close_rx);

    info!("musterd ready");
    signal::ctrl_c().await?;
    info!("musterd shutting down");
    let _ = close_tx.send(true);
    manager.shutdown().await;
    let _ = cron.await;
    Ok(())
}
