mod api;
mod bus;
mod config;
mod error;
mod ingest;
mod normalize;
mod store;
mod store_manager;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::bus::{PubSubClient, SubscriptionAdmin};
use crate::config::Config;
use crate::store::ScanDb;
use crate::store_manager::StoreHandle;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scan_processord=info"))
        )
        .init();

    tracing::info!("Starting scan-processord");

    // Load config; every setting has a default, so the file is optional
    let mut config = match std::env::args().nth(1) {
        Some(config_path) => {
            let config = Config::load(&config_path)
                .with_context(|| format!("Failed to load config from {}", config_path))?;
            tracing::info!("Loaded config from {}", config_path);
            config
        }
        None => Config::default(),
    };
    config.apply_env();

    // Open SQLite database
    let db = ScanDb::open(&config.store.db_path, config.store.busy_timeout())
        .with_context(|| format!("Failed to open database at {}", config.store.db_path.display()))?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    let store = StoreHandle::spawn(db);

    // Bind before subscribing; no startup error may follow subscription creation
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Subscribe before anything consumes; failure here is fatal
    let pubsub = PubSubClient::new(&config.pubsub).context("Failed to create Pub/Sub client")?;
    let subscription = bus::establish(
        &pubsub,
        &config.pubsub.topic,
        &config.pubsub.subscription_prefix,
    )
    .await
    .context("Failed to set subscription")?;
    let subscriber = Arc::new(pubsub.subscriber(subscription.name.clone()));
    tracing::info!(
        topic = %subscription.topic,
        subscription = subscriber.subscription(),
        "Consuming subscription"
    );

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn ingestion loop
    let ingest_handle = tokio::spawn(ingest::run(
        subscriber,
        store.clone(),
        config.ingest.clone(),
        cancel.clone(),
    ));

    // Spawn store reporter
    let report_store = store.clone();
    let report_config = config.report.clone();
    let report_cancel = cancel.clone();
    let report_handle = tokio::spawn(async move {
        if let Err(e) = store_manager::run_reporter(report_store, report_config, report_cancel).await {
            tracing::error!("Store reporter error: {}", e);
        }
    });

    // Build API router
    let app = api::routes::router(api::routes::AppState { store: store.clone() });

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!("Failed to listen for ctrl-c, shutting down: {}", e),
    }

    // Trigger cancellation
    cancel.cancel();

    // Wait for in-flight messages and the other tasks to finish
    let _ = tokio::join!(ingest_handle, report_handle, server_handle);

    if config.pubsub.delete_subscription_on_shutdown {
        match pubsub.delete_subscription(&subscription.name).await {
            Ok(()) => tracing::info!("Deleted subscription {}", subscription.name),
            Err(e) => tracing::error!("Failed to delete subscription {}: {}", subscription.name, e),
        }
    }

    // Shutdown store thread
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
