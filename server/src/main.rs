#![deny(unused_must_use)]
mod adapter;
mod analysis;
mod clock;
mod config;
mod database;
mod errors;
mod hub;
mod netmon;
mod scheduler;
mod state;
mod stats;
mod store;

use adapter::signal::SignalAdapter;
use adapter::whatsapp::WhatsAppAdapter;
use adapter::PlatformAdapter;
use analysis::AnalysisEngine;
use common::Channel;
use netmon::NetworkMonitor;
use scheduler::ProbeRegistry;
use state::AppState;
use std::collections::HashMap;
use std::sync::Arc;
use store::MeasurementStore;
use tokio::sync::{broadcast, mpsc};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration; anything invalid is fatal before we touch state
    let config = match config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    init_tracing(&config.logging);

    tracing::info!("Starting ackwatch server");
    tracing::info!("  Listen: {}:{}", config.server.host, config.server.port);
    tracing::info!("  Data dir: {}", config.storage.data_dir);
    tracing::info!("  Signal bridge: {}", config.bridges.signal_api_url);
    tracing::info!("  WhatsApp bridge: {}", config.bridges.whatsapp_api_url);
    tracing::info!(
        "  Reference endpoint: {}:{}",
        config.reference.host,
        config.reference.port
    );

    if let Err(e) = std::fs::create_dir_all(&config.storage.data_dir) {
        tracing::error!(
            "Cannot create data directory {}: {}",
            config.storage.data_dir,
            e
        );
        std::process::exit(1);
    }
    let db_path = std::path::Path::new(&config.storage.data_dir).join("tracker.db");
    let db = match database::init_database(&db_path) {
        Ok(db) => {
            tracing::info!("Database initialized at {:?}", db_path);
            db
        }
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };
    let store = Arc::new(MeasurementStore::new(db));
    match store.tracked_channels().await {
        Ok(pairs) if !pairs.is_empty() => {
            tracing::info!(
                "store holds history for {} previously tracked targets",
                pairs.len()
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("could not enumerate stored targets: {}", e),
    }

    // Control signal starts before any target probing
    let monitor = Arc::new(NetworkMonitor::new(
        store.clone(),
        config.reference.host.clone(),
        config.reference.port,
    ));
    monitor.start();

    // Bridge links retry in the background; an unlinked platform just
    // pauses its scheduling, it never fails the process.
    let mut adapters: HashMap<Channel, Arc<dyn PlatformAdapter>> = HashMap::new();
    adapters.insert(
        Channel::Whatsapp,
        WhatsAppAdapter::new(config.bridges.whatsapp_api_url.clone()),
    );
    adapters.insert(
        Channel::Signal,
        SignalAdapter::new(config.bridges.signal_api_url.clone()),
    );

    let (updates_tx, _) = broadcast::channel(256);
    let (analysis_tx, analysis_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(ProbeRegistry::new());

    let app_state = AppState::new(
        store.clone(),
        monitor.clone(),
        adapters,
        registry.clone(),
        analysis_tx,
        updates_tx.clone(),
    );

    for platform_adapter in app_state.adapters.values() {
        let _ = scheduler::spawn_receipt_consumer(platform_adapter.clone(), registry.clone());
    }

    let engine = Arc::new(AnalysisEngine::new(store.clone(), updates_tx));
    let _ = analysis::spawn_analysis_worker(engine.clone(), analysis_rx);
    let _ = analysis::spawn_analysis_sweep(engine, app_state.targets.clone());

    let router = hub::router(app_state.clone(), config.server.client_origin.as_deref());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("Live update hub listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Bounded grace for in-flight probe cycles and store writes
    let wind_down = async {
        app_state.stop_all_targets().await;
        monitor.stop().await;
    };
    if tokio::time::timeout(std::time::Duration::from_secs(10), wind_down)
        .await
        .is_err()
    {
        tracing::warn!("shutdown grace period expired with tasks still running");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received");
}

fn init_tracing(logging: &config::LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let directive = if let Some(filter) = &logging.filter {
        filter.clone()
    } else if logging.debug {
        // DEBUG flag: verbose logging including per-row store appends
        "debug".to_string()
    } else {
        logging.level.clone()
    };

    match EnvFilter::try_new(&directive) {
        Ok(env_filter) => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
        Err(e) => {
            eprintln!(
                "Warning: invalid log filter '{}': {}. Using default.",
                directive, e
            );
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::INFO)
                .init();
        }
    }
}
