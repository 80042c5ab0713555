// =============================================================================
// Meridian Execution Gateway — Main Entry Point
// =============================================================================
//
// Startup order: environment → config → store → shared cache → state wiring →
// startup reconciliation → HTTP server + background tasks. Missing required
// configuration (store endpoint in live mode, admin token) is fatal: the
// process refuses to start rather than run half-configured.
//
// Shutdown is cooperative: Ctrl-C flips the watch channel, the HTTP listener
// stops accepting, in-flight work drains up to a grace deadline, and the
// process exits. Tracker and caches are not persisted — the store is
// authoritative.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod error;
mod executor;
mod intent;
mod ml;
mod notify;
mod risk;
mod settings;
mod store;
mod tracker;
mod types;
mod venues;
mod worker;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::GatewayConfig;
use crate::store::{MemoryStore, RestStore, Store};

/// Seconds allowed for in-flight work after the shutdown signal.
const SHUTDOWN_GRACE_SECS: u64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Execution Gateway starting");

    // ── 2. Config ────────────────────────────────────────────────────────
    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "gateway_config.json".to_string());
    let config = GatewayConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "gateway config not loaded — using defaults");
        GatewayConfig::default()
    });

    let admin_token = std::env::var("MERIDIAN_ADMIN_TOKEN").unwrap_or_default();
    if admin_token.is_empty() {
        anyhow::bail!("MERIDIAN_ADMIN_TOKEN is not set — refusing to start");
    }

    // ── 3. Store ─────────────────────────────────────────────────────────
    let demo_mode = std::env::var("MERIDIAN_DEMO").map(|v| v == "1").unwrap_or(false);
    let store: Arc<dyn Store> = if demo_mode {
        warn!("MERIDIAN_DEMO=1 — using the in-memory store; nothing will persist");
        Arc::new(MemoryStore::new())
    } else {
        let url = std::env::var("MERIDIAN_STORE_URL")
            .context("MERIDIAN_STORE_URL is not set — refusing to start")?;
        let key = std::env::var("MERIDIAN_STORE_KEY")
            .context("MERIDIAN_STORE_KEY is not set — refusing to start")?;
        Arc::new(RestStore::new(url, &key).context("store client construction failed")?)
    };

    // ── 4. Shared risk cache (optional) ──────────────────────────────────
    let redis = match std::env::var("MERIDIAN_REDIS_URL") {
        Ok(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                Ok(manager) => {
                    info!("shared risk cache connected");
                    Some(manager)
                }
                Err(e) => {
                    warn!(error = %e, "redis unreachable — risk cache degrades to in-process");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "redis URL invalid — risk cache degrades to in-process");
                None
            }
        },
        Err(_) => None,
    };

    // ── 5. Wire up state ─────────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, admin_token, store.clone(), redis));
    info!(bind_addr = %state.config.bind_addr, "subsystems wired");

    // ── 6. Startup reconciliation ────────────────────────────────────────
    match store.list_credentials().await {
        Ok(credentials) => {
            info!(count = credentials.len(), "reconciling venues at startup");
            for record in credentials {
                match state.registry.resolve(&record.user_id, &record.venue).await {
                    Ok(adapter) => {
                        if let Err(e) = state
                            .tracker
                            .reconcile(&record.user_id, &record.venue, adapter.as_ref())
                            .await
                        {
                            warn!(
                                user_id = %record.user_id,
                                venue = %record.venue,
                                error = %e,
                                "startup reconciliation failed for pair"
                            );
                        }
                    }
                    Err(e) => warn!(
                        user_id = %record.user_id,
                        venue = %record.venue,
                        error = %e,
                        "adapter construction failed at startup"
                    ),
                }
            }
        }
        Err(e) => warn!(error = %e, "credential listing failed — skipping startup reconciliation"),
    }

    // ── 7. Shutdown signal ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 8. Background tasks ──────────────────────────────────────────────
    if let Some(ai_worker) = state.build_worker() {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            ai_worker.run(rx).await;
        });
    } else {
        info!("AI signal worker disabled by config");
    }

    {
        let tracker = state.tracker.clone();
        let settings = state.settings.clone();
        let trade_executor = state.executor.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            worker::run_window_sweeper(tracker, settings, trade_executor, rx).await;
        });
    }

    // ── 9. HTTP server ───────────────────────────────────────────────────
    let app = api::routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", state.config.bind_addr))?;
    info!(addr = %state.config.bind_addr, "HTTP server listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "HTTP server failed");
        }
    });

    // ── 10. Wait for Ctrl-C, then drain ──────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — refusing new work and draining");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(
        std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS),
        server,
    )
    .await
    {
        Ok(_) => info!("HTTP server drained"),
        Err(_) => warn!(
            grace_secs = SHUTDOWN_GRACE_SECS,
            "grace deadline elapsed with work in flight — exiting anyway"
        ),
    }

    info!("Meridian Execution Gateway shut down");
    Ok(())
}
