//! Read-only query surface over the storage gateway.
//!
//! All responses are `{"data": [...]}`; invalid/missing parameters return
//! 400, unknown failures 500 — both with `{"error": "..."}`.

use axum::{
    extract::{FromRequestParts, Query, State as AxumState},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use crate::models::{Candle, Exchange, Interval, Side, Trade};
use crate::storage::{CandleQuery as StorageCandleQuery, MarketSummary, TradeQuery as StorageTradeQuery};
use crate::AppState;

const DEFAULT_CANDLES_LIMIT: u32 = 1000;
const MAX_CANDLES_LIMIT: u32 = 5000;
const DEFAULT_TRADES_LIMIT: u32 = 100;
const MAX_TRADES_LIMIT: u32 = 1000;
const DEFAULT_LATEST_LIMIT: u32 = 50;
const MAX_LATEST_LIMIT: u32 = 200;

#[derive(Debug, Serialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Wraps `Query<T>` so a missing or unparsable query string also produces
/// the `{"error": "..."}` envelope, instead of axum's plain-text
/// `QueryRejection` body.
struct ApiQuery<T>(T);

#[async_trait::async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(params)| ApiQuery(params))
            .map_err(|rejection| ApiError::bad_request(rejection.to_string()))
    }
}

fn parse_exchange(raw: &str) -> Result<Exchange, ApiError> {
    raw.parse().map_err(|_| ApiError::bad_request(format!("invalid exchange: {raw}")))
}

fn parse_interval(raw: &str) -> Result<Interval, ApiError> {
    raw.parse().map_err(|_| ApiError::bad_request(format!("invalid interval: {raw}")))
}

fn parse_side(raw: &str) -> Result<Side, ApiError> {
    raw.parse().map_err(|_| ApiError::bad_request(format!("invalid side: {raw}")))
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ApiError::bad_request(format!("invalid {field}: {raw}")))
}

#[derive(Debug, Deserialize)]
pub struct CandlesParams {
    pub exchange: String,
    pub market_id: String,
    pub interval: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<u32>,
}

pub async fn get_candles(
    ApiQuery(params): ApiQuery<CandlesParams>,
    AxumState(state): AxumState<AppState>,
) -> Result<Json<DataEnvelope<Candle>>, ApiError> {
    let exchange = parse_exchange(&params.exchange)?;
    let interval = parse_interval(&params.interval)?;
    let start = params.start.as_deref().map(|s| parse_timestamp(s, "start")).transpose()?;
    let end = params.end.as_deref().map(|s| parse_timestamp(s, "end")).transpose()?;
    let limit = params.limit.unwrap_or(DEFAULT_CANDLES_LIMIT).min(MAX_CANDLES_LIMIT);

    let candles = state
        .storage
        .query_candles(exchange, &params.market_id, interval, StorageCandleQuery { start, end, limit })
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(DataEnvelope { data: candles }))
}

#[derive(Debug, Deserialize)]
pub struct MarketsParams {
    pub exchange: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MarketEntry {
    pub exchange: Exchange,
    pub market_id: String,
    pub trade_count: u64,
    pub trades_last_10m: u64,
    pub last_trade_at: DateTime<Utc>,
}

impl From<MarketSummary> for MarketEntry {
    fn from(s: MarketSummary) -> Self {
        Self {
            exchange: s.exchange,
            market_id: s.market_id,
            trade_count: s.trade_count,
            trades_last_10m: s.trades_last_10m,
            last_trade_at: s.last_trade_at,
        }
    }
}

pub async fn get_candle_markets(
    ApiQuery(params): ApiQuery<MarketsParams>,
    AxumState(state): AxumState<AppState>,
) -> Result<Json<DataEnvelope<MarketEntry>>, ApiError> {
    let exchange = params.exchange.as_deref().map(parse_exchange).transpose()?;
    let markets = state
        .storage
        .markets_with_trades(exchange)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(DataEnvelope { data: markets.into_iter().map(MarketEntry::from).collect() }))
}

pub async fn get_trade_markets(
    params: ApiQuery<MarketsParams>,
    state: AxumState<AppState>,
) -> Result<Json<DataEnvelope<MarketEntry>>, ApiError> {
    get_candle_markets(params, state).await
}

#[derive(Debug, Deserialize)]
pub struct TradesParams {
    pub exchange: String,
    pub market_id: String,
    pub side: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<u32>,
}

pub async fn get_trades(
    ApiQuery(params): ApiQuery<TradesParams>,
    AxumState(state): AxumState<AppState>,
) -> Result<Json<DataEnvelope<Trade>>, ApiError> {
    let exchange = parse_exchange(&params.exchange)?;
    let side = params.side.as_deref().map(parse_side).transpose()?;
    let start = params.start.as_deref().map(|s| parse_timestamp(s, "start")).transpose()?;
    let end = params.end.as_deref().map(|s| parse_timestamp(s, "end")).transpose()?;
    let limit = params.limit.unwrap_or(DEFAULT_TRADES_LIMIT).min(MAX_TRADES_LIMIT);

    let trades = state
        .storage
        .query_trades(exchange, &params.market_id, StorageTradeQuery { side, start, end, limit })
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(DataEnvelope { data: trades }))
}

#[derive(Debug, Deserialize)]
pub struct LatestTradesParams {
    pub exchange: Option<String>,
    pub limit: Option<u32>,
}

pub async fn get_latest_trades(
    ApiQuery(params): ApiQuery<LatestTradesParams>,
    AxumState(state): AxumState<AppState>,
) -> Result<Json<DataEnvelope<Trade>>, ApiError> {
    let exchange = params.exchange.as_deref().map(parse_exchange).transpose()?;
    let limit = params.limit.unwrap_or(DEFAULT_LATEST_LIMIT).min(MAX_LATEST_LIMIT);

    let trades = state
        .storage
        .latest_trades(exchange, limit)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(DataEnvelope { data: trades }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn health_check(AxumState(state): AxumState<AppState>) -> Response {
    if state.storage.is_reachable() {
        Json(HealthResponse { status: "ok" }).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(HealthResponse { status: "unreachable" })).into_response()
    }
}

pub async fn get_stats(AxumState(state): AxumState<AppState>) -> Json<crate::performance::StatsSnapshot> {
    Json(state.performance.snapshot())
}
