//! PulseWatch - multi-tenant uptime monitoring service.
//!
//! Probes registered HTTP(S) endpoints on per-node timers, tracks their
//! failure state, and serves bucketed telemetry over a JSON API.

mod config;
mod db;
mod probe;
mod scheduler;
mod service;
mod telemetry;
#[cfg(test)]
mod testutil;
mod web;

use config::ServerConfig;
use db::Store;
use scheduler::Scheduler;
use service::Service;
use telemetry::Telemetry;
use web::Server;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pulsewatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting PulseWatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Wire up the core
    let scheduler = Arc::new(Scheduler::new(store.clone()));
    let telemetry = Arc::new(Telemetry::new(store.clone()));
    let service = Arc::new(Service::new(
        store.clone(),
        scheduler.clone(),
        telemetry,
    ));

    // Install a timer for every schedulable node
    scheduler.boot().await?;

    // Serve until interrupted
    let server = Server::new(cfg, service);
    server.start().await?;

    // Let in-flight probes drain within the probe deadline
    scheduler.shutdown(Duration::from_secs(30)).await;

    Ok(())
}
