//! marketpulse — real-time ingestion, aggregation, and fan-out for
//! prediction-market trades.
//!
//! This binary is thin wiring: it builds the shared [`AppState`], runs
//! candle backfill to completion, spawns the ingesters and aggregator, and
//! serves the HTTP/WebSocket surface. All component logic lives in the
//! library (`src/lib.rs` and its modules).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::ws::WebSocketUpgrade,
    extract::State,
    response::Response,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketpulse_backend::aggregator::CandleAggregator;
use marketpulse_backend::api;
use marketpulse_backend::bus::TradeBus;
use marketpulse_backend::config::Config;
use marketpulse_backend::ingest::{KalshiCredentials, KalshiIngester, PolymarketIngester};
use marketpulse_backend::middleware::request_logging_simple;
use marketpulse_backend::performance::PerformanceTracker;
use marketpulse_backend::resolver::{MarketTitleResolver, NoopResolver};
use marketpulse_backend::storage::{SqliteStorage, StorageGateway};
use marketpulse_backend::ws::{handle_socket, Hub};
use marketpulse_backend::AppState;

/// Grace period each shutdown stage gets to drain before the next begins.
/// Past it, the stage's tasks are simply dropped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("loading configuration")?;
    info!(port = config.port, database_url = %config.database_url, "marketpulse starting up");

    let storage: Arc<dyn StorageGateway> =
        Arc::new(SqliteStorage::open(&config.database_url).context("opening storage gateway")?);
    let bus = TradeBus::new();
    let hub = Hub::new();
    let performance = Arc::new(PerformanceTracker::new());
    let resolver: Arc<dyn MarketTitleResolver> = Arc::new(NoopResolver);

    let state = AppState {
        storage: storage.clone(),
        bus: bus.clone(),
        hub: hub.clone(),
        performance: performance.clone(),
        resolver,
    };

    // Backfill runs to completion before any ingester starts, so live
    // upserts never race a backfill over the same bucket.
    let aggregator = Arc::new(CandleAggregator::new(storage.clone(), bus.clone()));
    aggregator.backfill().context("candle backfill")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut ingester_handles = Vec::new();

    if let (Some(api_key_id), Some(private_key_pem)) =
        (config.kalshi_api_key_id.clone(), config.kalshi_private_key.clone())
    {
        let kalshi = KalshiIngester::new(
            KalshiCredentials { api_key_id, private_key_pem },
            config.kalshi_markets.clone(),
            storage.clone(),
            bus.clone(),
        );
        let rx = shutdown_rx.clone();
        ingester_handles.push(tokio::spawn(async move { kalshi.run(rx).await }));
        info!(markets = config.kalshi_markets.len(), "kalshi ingester started");
    } else {
        warn!("KALSHI_API_KEY_ID/KALSHI_PRIVATE_KEY not set, kalshi ingester disabled");
    }

    if let Some(ws_url) = config.alchemy_ws_url.clone() {
        match polymarket_exchange_address() {
            Ok(exchange_contract) => {
                let storage = storage.clone();
                let bus = bus.clone();
                let rx = shutdown_rx.clone();
                ingester_handles.push(tokio::spawn(async move {
                    let polymarket =
                        PolymarketIngester::new(ws_url, exchange_contract, storage, bus, 0);
                    polymarket.run(rx).await
                }));
                info!("polymarket ingester started");
            }
            Err(e) => error!(error = %e, "failed to configure polymarket exchange address"),
        }
    } else {
        warn!("ALCHEMY_WS_URL not set, polymarket ingester disabled");
    }

    let aggregator_handle = {
        let aggregator = aggregator.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { aggregator.run(rx).await })
    };

    let dispatch_handle = {
        let hub = hub.clone();
        let performance = performance.clone();
        let subscription = bus.subscribe();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    trade = subscription.recv() => {
                        performance.record(trade.exchange, trade.timestamp, chrono::Utc::now());
                        hub.dispatch(&trade);
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    };

    let app = build_router(config.frontend_url.as_deref(), state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.context("binding listener")?;
    info!(addr = %addr, "marketpulse listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Shutdown order: ingesters stop and drain, aggregator drains the bus,
    // hub closes connections, storage pool closes last.
    info!("shutdown signal received, draining pipeline");
    let _ = shutdown_tx.send(true);

    for handle in ingester_handles {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
    }
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, aggregator_handle).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, dispatch_handle).await;

    hub.close_all();
    info!("marketpulse shut down cleanly");

    Ok(())
}

fn build_router(frontend_url: Option<&str>, state: AppState) -> Router {
    let cors = match frontend_url {
        Some(origin) => match origin.parse::<axum::http::HeaderValue>() {
            Ok(origin) => CorsLayer::new().allow_origin(origin).allow_methods(Any).allow_headers(Any),
            Err(_) => {
                warn!(origin, "FRONTEND_URL is not a valid origin, falling back to permissive CORS");
                CorsLayer::permissive()
            }
        },
        None => CorsLayer::permissive(),
    };

    Router::new()
        .route("/candles", get(api::get_candles))
        .route("/candles/markets", get(api::get_candle_markets))
        .route("/trades", get(api::get_trades))
        .route("/trades/latest", get(api::get_latest_trades))
        .route("/trades/markets", get(api::get_trade_markets))
        .route("/health", get(api::health_check))
        .route("/stats", get(api::get_stats))
        .route("/ws", get(websocket_handler))
        .layer(cors)
        .layer(axum::middleware::from_fn(request_logging_simple))
        .with_state(state)
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

/// The Polymarket CTF Exchange contract address. Hardcoded to mainnet here,
/// same as the upstream's own deployed address, with room to promote to
/// config if multiple deployments are ever tracked at once.
fn polymarket_exchange_address() -> Result<alloy::primitives::Address> {
    use std::str::FromStr;
    alloy::primitives::Address::from_str("0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E")
        .context("invalid polymarket exchange address")
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketpulse_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sig = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sig.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
