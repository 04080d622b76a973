//! nexboard - monitoring core of a self-hosted status dashboard.
//!
//! Probes registered applications, debounces their health, raises alerts and
//! delivers notifications through a persistent email queue.

mod alerts;
mod config;
mod db;
mod error;
mod health;
mod notify;
mod probe;
mod queue;
mod scheduler;
mod service;
mod web;

use config::MonitorConfig;
use db::Store;
use notify::{spawn_webhook_worker, Dispatcher, HttpWebhookSender, LogMailer};
use probe::NetworkProber;
use queue::EmailQueueProcessor;
use service::Monitor;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("nexboard=info".parse()?))
        .init();

    let cfg = MonitorConfig::load();
    tracing::info!("Starting nexboard on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Notifications
    let webhook_sender = Arc::new(HttpWebhookSender::new(cfg.queue.send_timeout)?);
    let (webhook_tx, webhook_worker) = spawn_webhook_worker(webhook_sender, 256);
    let dispatcher = Arc::new(
        Dispatcher::new(store.clone()).with_webhooks(webhook_tx, cfg.webhook_url.clone()),
    );

    // Monitoring core
    let prober = Arc::new(NetworkProber::new()?);
    let monitor = Arc::new(Monitor::new(
        store.clone(),
        prober,
        dispatcher,
        cfg.schedule.clone(),
        cfg.thresholds,
        cfg.alerts,
    ));
    monitor.start().await?;

    let queue = EmailQueueProcessor::new(store, Arc::new(LogMailer), cfg.queue.clone());
    let queue_task = queue.start().await;

    let server = Server::new(cfg.http_port, monitor.clone());
    server.start(shutdown_signal()).await?;

    tracing::info!("Shutting down...");
    monitor.shutdown().await;
    queue.stop().await;
    if let Err(e) = queue_task.await {
        tracing::error!("Email queue task ended abnormally: {}", e);
    }
    // The dispatcher holds the last webhook sender; dropping the monitor lets the worker drain.
    drop(server);
    drop(monitor);
    if tokio::time::timeout(cfg.queue.send_timeout, webhook_worker).await.is_err() {
        tracing::warn!("Webhook worker did not finish in time");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
