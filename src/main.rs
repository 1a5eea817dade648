// =============================================================================
// OKX Market Sync — Main Entry Point
// =============================================================================
//
// Keeps instruments and OHLCV candles from the OKX REST API in the store and
// republishes live trades from the public WebSocket onto the message bus.
// Without DATABASE_URL the service runs on the in-memory store; without
// REDIS_URL trades go to the in-process broadcast bus.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod bus;
mod config;
mod error;
mod market_data;
mod okx;
mod price;
mod scheduler;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::bus::{LocalBus, MessageBus, RedisBus};
use crate::config::AppConfig;
use crate::market_data::{
    CandleSyncEngine, CandleSyncSettings, EndpointDialer, InstrumentSynchronizer,
    TradeStreamIngestor,
};
use crate::okx::OkxClient;
use crate::scheduler::{JobName, Scheduler};
use crate::store::{CandleStore, CursorProvider, InstrumentStore, MemoryStore, PgStore};

const DEFAULT_CONFIG_PATH: &str = "market_sync.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment, logging & config ─────────────────────────────────
    let _ = dotenv::dotenv();
    init_tracing();

    info!("OKX market sync starting");

    let config_path =
        std::env::var("MARKET_SYNC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let config = AppConfig::from_env_and_file(&config_path).context("invalid configuration")?;

    info!(
        pairs = ?config.pairs(),
        bar = %config.exchange.candles_bar,
        api_uri = %config.exchange.api_uri,
        "configuration loaded"
    );

    // ── 2. Exchange client ───────────────────────────────────────────────
    let client = Arc::new(OkxClient::new(&config.exchange, config.credentials.clone())?);

    // ── 3. Store & synchronizers ─────────────────────────────────────────
    let (instruments, candles) = match config.database.url.as_deref() {
        Some(url) => {
            let store = Arc::new(PgStore::connect(url, &config.database).await?);
            build_synchronizers(store, client.clone(), &config)
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store (data is lost on exit)");
            build_synchronizers(Arc::new(MemoryStore::new()), client.clone(), &config)
        }
    };
    let scheduler = Arc::new(Scheduler::new(instruments, candles));

    // ── 4. Message bus ───────────────────────────────────────────────────
    let bus: Arc<dyn MessageBus> = match config.bus.redis_url.as_deref() {
        Some(url) => {
            let (bus, _publisher) = RedisBus::connect(url).await?;
            Arc::new(bus)
        }
        None => {
            warn!("REDIS_URL not set; trades are published on the in-process bus only");
            Arc::new(LocalBus::default())
        }
    };

    // ── 5. Trade stream ──────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let ingestor = Arc::new(TradeStreamIngestor::new(
        &config,
        Arc::new(EndpointDialer::new(config.exchange.wss_endpoint.clone())),
        bus,
    ));
    let stream_stats = ingestor.stats();
    let stream_handle = {
        let ingestor = ingestor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ingestor.run(cancel).await })
    };

    // ── 6. Scheduled jobs ────────────────────────────────────────────────
    if config.schedule.backfill_on_start {
        let sched = scheduler.clone();
        tokio::spawn(async move {
            sched.run_job(JobName::Backfill).await;
        });
    }
    let periodic = vec![
        scheduler.spawn_periodic(
            JobName::Instruments,
            Duration::from_secs(config.schedule.instrument_sync_secs),
            true,
            cancel.clone(),
        ),
        scheduler.spawn_periodic(
            JobName::Refresh,
            Duration::from_secs(config.schedule.candle_refresh_secs),
            false,
            cancel.clone(),
        ),
    ];

    // ── 7. API server ────────────────────────────────────────────────────
    let state = Arc::new(AppState::new(&config, scheduler.clone(), stream_stats));
    let listener = tokio::net::TcpListener::bind(&config.api.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.api.bind_addr))?;
    info!(addr = %config.api.bind_addr, "API server listening");

    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        let app = api::rest::router(state);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_cancel.cancelled().await })
            .await
        {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    shutdown_signal().await;
    warn!("Shutdown signal received — stopping gracefully");
    cancel.cancel();

    if let Err(e) = stream_handle.await {
        error!(error = %e, "trade stream task panicked");
    }
    for handle in periodic {
        let _ = handle.await;
    }
    let _ = api_handle.await;

    info!("OKX market sync shut down complete.");
    Ok(())
}

/// `RUST_LOG` filter (default `info`); `LOG_FORMAT=json` for JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_synchronizers<S>(
    store: Arc<S>,
    client: Arc<OkxClient>,
    config: &AppConfig,
) -> (Arc<InstrumentSynchronizer>, Arc<CandleSyncEngine>)
where
    S: InstrumentStore + CandleStore + CursorProvider + 'static,
{
    let instruments = Arc::new(InstrumentSynchronizer::new(client.clone(), store.clone()));
    let candles = Arc::new(CandleSyncEngine::new(
        client,
        store.clone(),
        store,
        CandleSyncSettings::from_config(config),
    ));
    (instruments, candles)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
