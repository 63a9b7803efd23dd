//! Market Breadth Index Service
//!
//! Computes a market-breadth index over the USDT-margined perpetual
//! futures universe every five minutes and serves it over HTTP.
//!
//! ## Features
//! - Two-phase concurrent historical backfill on startup
//! - Five-minute live collection aligned 10s past the boundary
//! - Per-symbol base prices frozen at first observation
//! - Rise-distribution and uptrend-wave analytical queries
//! - Rate-limit tripwire halting all exchange traffic on 429/418
//! - Graceful shutdown on SIGTERM

use market_breadth::api::{self, AppContext};
use market_breadth::backfill::BackfillOrchestrator;
use market_breadth::base_price::BasePriceRegistry;
use market_breadth::binance::BinanceClient;
use market_breadth::collector::LiveCollector;
use market_breadth::config::Config;
use market_breadth::database::Database;
use market_breadth::errors::Result;
use market_breadth::timeutil::delay_until_next_tick;
use market_breadth::uptrend::UptrendCache;

use chrono::Utc;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting Market Breadth Index Service");

    let config = Config::from_env()?;
    info!("Configuration loaded:");
    info!("  Exchange base URL: {}", config.exchange_base_url);
    info!(
        "  Database: {}:{}/{}",
        config.database.host, config.database.port, config.database.name
    );
    info!(
        "  Backfill: {} days, concurrency {}",
        config.backfill_days, config.backfill_concurrency
    );
    info!("  HTTP port: {}", config.http_port);

    info!("Connecting to database...");
    let db = Arc::new(Database::connect(&config.database).await?);
    db.ensure_schema().await?;

    let client = Arc::new(BinanceClient::new(&config)?);
    let registry = Arc::new(BasePriceRegistry::new(db.clone()));
    let loaded = registry.load().await?;
    info!("Loaded {loaded} base prices from store");

    let uptrend_cache = Arc::new(UptrendCache::new());
    let backfill_in_progress = Arc::new(AtomicBool::new(false));
    let backfill_complete = Arc::new(AtomicBool::new(false));

    let backfill = Arc::new(BackfillOrchestrator::new(
        db.clone(),
        client.clone(),
        registry.clone(),
        config.backfill_days,
        config.backfill_concurrency,
    ));

    let collector = Arc::new(LiveCollector::new(
        db.clone(),
        client.clone(),
        registry.clone(),
        uptrend_cache.clone(),
        backfill_in_progress.clone(),
        backfill_complete.clone(),
        config.collect_concurrency,
    ));

    let ctx = Arc::new(AppContext {
        db: db.clone(),
        client: client.clone(),
        registry: registry.clone(),
        uptrend_cache: uptrend_cache.clone(),
        backfill: backfill.clone(),
        backfill_in_progress: backfill_in_progress.clone(),
        backfill_complete: backfill_complete.clone(),
    });

    // Query surface
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Query surface listening on {addr}");
    let server_handle = tokio::spawn({
        let app = api::router(ctx);
        async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("HTTP server error: {e}");
            }
        }
    });

    // Historical backfill; live collection stays blocked until it
    // completes, and on failure remains blocked pending operator action.
    let backfill_handle = tokio::spawn({
        let backfill = backfill.clone();
        let in_progress = backfill_in_progress.clone();
        let complete = backfill_complete.clone();
        async move {
            in_progress.store(true, Ordering::SeqCst);
            match backfill.run().await {
                Ok(()) => {
                    complete.store(true, Ordering::SeqCst);
                    info!("Historical backfill complete, live collection enabled");
                }
                Err(e) => {
                    error!("Historical backfill failed, live collection stays blocked: {e}");
                }
            }
            in_progress.store(false, Ordering::SeqCst);
        }
    });

    // Live collection scheduler: second 10 past every 5-minute boundary
    // so the exchange has finalized the just-closed bucket.
    let collector_handle = tokio::spawn({
        let collector = collector.clone();
        async move {
            loop {
                tokio::time::sleep(delay_until_next_tick(Utc::now())).await;
                if let Err(e) = collector.tick().await {
                    error!("Collection tick failed: {e}");
                }
            }
        }
    });

    info!("Service started, waiting for shutdown signal...");
    wait_for_shutdown().await;

    info!("Shutdown signal received, stopping tasks...");
    collector_handle.abort();
    backfill_handle.abort();
    server_handle.abort();

    info!("Market Breadth Index Service stopped");
    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown() {
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
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
