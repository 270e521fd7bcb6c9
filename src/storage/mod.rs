//! Storage gateway: the only component that talks to the relational store.

mod sqlite;

pub use sqlite::SqliteStorage;

use chrono::{DateTime, Utc};

use crate::error::{InsertOutcome, StorageError};
use crate::models::{Candle, Exchange, Interval, Side, Trade};

/// Parameters shared by the candle and trade range queries.
#[derive(Debug, Clone, Default)]
pub struct TradeQuery {
    pub side: Option<Side>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CandleQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: u32,
}

/// A market that has produced trades, with enough summary data to support
/// the `/candles/markets` and `/trades/markets` listings.
#[derive(Debug, Clone)]
pub struct MarketSummary {
    pub exchange: Exchange,
    pub market_id: String,
    pub trade_count: u64,
    pub trades_last_10m: u64,
    pub last_trade_at: DateTime<Utc>,
}

/// Idempotent writes and range reads over `trades` and `candles`.
///
/// Implemented by [`SqliteStorage`]. Kept as a trait so the aggregator,
/// ingesters, and HTTP handlers depend on the contract rather than the
/// concrete backend.
pub trait StorageGateway: Send + Sync {
    fn insert_trade(&self, trade: &Trade) -> Result<InsertOutcome, StorageError>;

    fn upsert_candle(
        &self,
        exchange: Exchange,
        market_id: &str,
        interval: Interval,
        open_time: DateTime<Utc>,
        price: rust_decimal::Decimal,
        quantity: rust_decimal::Decimal,
        trade_timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    fn query_candles(
        &self,
        exchange: Exchange,
        market_id: &str,
        interval: Interval,
        query: CandleQuery,
    ) -> Result<Vec<Candle>, StorageError>;

    fn query_trades(
        &self,
        exchange: Exchange,
        market_id: &str,
        query: TradeQuery,
    ) -> Result<Vec<Trade>, StorageError>;

    fn latest_trades(
        &self,
        exchange: Option<Exchange>,
        limit: u32,
    ) -> Result<Vec<Trade>, StorageError>;

    fn markets_with_trades(
        &self,
        exchange: Option<Exchange>,
    ) -> Result<Vec<MarketSummary>, StorageError>;

    /// Rebuilds every candle from persisted trades. Idempotent: re-running
    /// produces byte-identical rows. Must run to completion before any
    /// ingester starts publishing.
    fn backfill_candles(&self) -> Result<(), StorageError>;

    fn is_reachable(&self) -> bool;
}
