//! HTLC Swap Relayer - off-chain coordinator for cross-chain atomic swaps
//!
//! Watches escrow ledgers on both chains, deploys the counterpart escrow for
//! each maker order, prices it by Dutch auction and settles or refunds both
//! legs.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use htlc_swap_relayer::api::{self, AppState};
use htlc_swap_relayer::chain::ChainManager;
use htlc_swap_relayer::config::{LogFormat, Settings};
use htlc_swap_relayer::coordination::{CoordinationEngine, SystemClock};
use htlc_swap_relayer::metrics::{self, MetricsServer};
use htlc_swap_relayer::state::{MemoryStateStore, PgStateStore, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first: it picks the log format
    let settings = Settings::load()?;

    init_logging(settings.logging.format);

    info!("Starting HTLC Swap Relayer v{}", env!("CARGO_PKG_VERSION"));
    info!("Instance {}", settings.relayer.instance_id);

    // State store: Postgres when configured, memory otherwise
    let state: Arc<dyn StateStore> = match settings.database.url.as_deref() {
        Some(url) if !url.is_empty() => {
            let store = PgStateStore::new(&settings.database).await?;
            info!("Database connection established");
            Arc::new(store)
        }
        _ => {
            warn!("No database configured; orders will not survive a restart");
            Arc::new(MemoryStateStore::new())
        }
    };

    state.run_migrations().await?;
    info!("State migrations complete");

    // Initialize chain manager (both ledgers of the pair)
    let chain_manager = Arc::new(ChainManager::from_settings(&settings)?);
    info!(
        "Chain connections initialized: {}",
        chain_manager.connected_chains().join(", ")
    );

    // Initialize coordination engine and reload in-flight orders
    let engine = Arc::new(
        CoordinationEngine::new(
            chain_manager.clone(),
            state.clone(),
            settings.relayer.clone(),
            Arc::new(SystemClock),
        )
        .await?,
    );
    engine.restore().await?;
    info!("Coordination engine initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start API server
    let api_handle = if settings.api.enabled {
        let config = settings.api.clone();
        let app_state = AppState::new(engine.clone(), state.clone());
        let mut shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let stop = async move {
                let _ = shutdown.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = api::run_server(config, app_state, stop).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start coordination engine
    let coordination_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Coordination engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let state = state.clone();
        let interval = settings.relayer.health_check_interval();
        let timeout = settings.relayer.gateway_timeout();
        async move {
            loop {
                tokio::time::sleep(interval).await;

                let mut healthy = true;

                // Check chain connections
                for (side, chain_id, ok) in chain_manager.health_check(timeout).await {
                    if !ok {
                        warn!("Chain {} ({}) health check failed", chain_id, side.as_str());
                        healthy = false;
                    }
                }

                // Check state store
                if let Err(e) = state.health_check().await {
                    warn!("State store health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("HTLC Swap Relayer is running");
    if settings.api.enabled {
        info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    }
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: let in-flight work finish, then stop serving
    engine.stop();
    if let Err(e) = coordination_handle.await {
        error!("Coordination engine task failed: {}", e);
    }
    shutdown_tx.send_replace(true);
    if let Some(h) = api_handle {
        if let Err(e) = h.await {
            error!("API server task failed: {}", e);
        }
    }

    // Abort background tasks
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("HTLC Swap Relayer stopped");
    Ok(())
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,htlc_swap_relayer=debug,sqlx=warn,hyper=warn")
    });

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
