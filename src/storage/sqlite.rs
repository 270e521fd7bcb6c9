//! SQLite-backed implementation of [`StorageGateway`].
//!
//! Embedded `rusqlite` (bundled) behind a single pooled connection guarded
//! by `parking_lot::Mutex`, WAL mode for concurrent reads during writes.
//! `NUMERIC` columns from the logical schema are `TEXT`, holding exact
//! decimal strings — SQLite has no arbitrary-precision numeric type, and
//! OHLCV arithmetic must never go through binary float. `TIMESTAMPTZ`
//! becomes an `INTEGER` column of epoch milliseconds.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;

use crate::error::{InsertOutcome, StorageError};
use crate::models::{Candle, Exchange, Interval, Side, Trade};

use super::{CandleQuery, MarketSummary, StorageGateway, TradeQuery};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL,
    market_id TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    side TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    tx_hash TEXT,
    dedupe_key TEXT NOT NULL UNIQUE
);

CREATE INDEX IF NOT EXISTS idx_trades_market_time
    ON trades(exchange, market_id, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_trades_time
    ON trades(timestamp DESC);

CREATE TABLE IF NOT EXISTS candles (
    exchange TEXT NOT NULL,
    market_id TEXT NOT NULL,
    interval TEXT NOT NULL,
    open_time INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    close_time INTEGER NOT NULL,
    volume TEXT NOT NULL,
    PRIMARY KEY (exchange, market_id, interval, open_time)
) WITHOUT ROWID;
"#;

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn decimal_from_col(s: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(s).map_err(|e| StorageError::InvalidParameter(format!("bad decimal {s}: {e}")))
}

pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
        let exchange: String = row.get("exchange")?;
        let side: String = row.get("side")?;
        let price: String = row.get("price")?;
        let quantity: String = row.get("quantity")?;
        let timestamp_ms: i64 = row.get("timestamp")?;

        Ok(Trade {
            id: row.get("id")?,
            exchange: exchange.parse().unwrap_or(Exchange::Kalshi),
            market_id: row.get("market_id")?,
            price: Decimal::from_str(&price).unwrap_or_default(),
            quantity: Decimal::from_str(&quantity).unwrap_or_default(),
            side: side.parse().unwrap_or(Side::Buy),
            timestamp: from_millis(timestamp_ms),
            tx_hash: row.get("tx_hash")?,
            dedupe_key: row.get("dedupe_key")?,
        })
    }

    fn row_to_candle(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candle> {
        let exchange: String = row.get("exchange")?;
        let interval: String = row.get("interval")?;
        let open_time_ms: i64 = row.get("open_time")?;
        let close_time_ms: i64 = row.get("close_time")?;

        Ok(Candle {
            exchange: exchange.parse().unwrap_or(Exchange::Kalshi),
            market_id: row.get("market_id")?,
            interval: interval.parse().unwrap_or(Interval::OneMinute),
            open_time: from_millis(open_time_ms),
            open: Decimal::from_str(&row.get::<_, String>("open")?).unwrap_or_default(),
            high: Decimal::from_str(&row.get::<_, String>("high")?).unwrap_or_default(),
            low: Decimal::from_str(&row.get::<_, String>("low")?).unwrap_or_default(),
            close: Decimal::from_str(&row.get::<_, String>("close")?).unwrap_or_default(),
            close_time: from_millis(close_time_ms),
            volume: Decimal::from_str(&row.get::<_, String>("volume")?).unwrap_or_default(),
        })
    }
}

impl StorageGateway for SqliteStorage {
    fn insert_trade(&self, trade: &Trade) -> Result<InsertOutcome, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO trades
                (exchange, market_id, price, quantity, side, timestamp, tx_hash, dedupe_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;

        let changes = stmt.execute(params![
            trade.exchange.as_str(),
            trade.market_id,
            trade.price.to_string(),
            trade.quantity.to_string(),
            trade.side.as_str(),
            to_millis(trade.timestamp),
            trade.tx_hash,
            trade.dedupe_key,
        ])?;

        if changes == 0 {
            return Ok(InsertOutcome::Duplicate);
        }

        Ok(InsertOutcome::Inserted(conn.last_insert_rowid()))
    }

    fn upsert_candle(
        &self,
        exchange: Exchange,
        market_id: &str,
        interval: Interval,
        open_time: DateTime<Utc>,
        price: Decimal,
        quantity: Decimal,
        trade_timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let inserted = tx
            .prepare_cached(
                "INSERT OR IGNORE INTO candles
                    (exchange, market_id, interval, open_time, open, high, low, close, close_time, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5, ?5, ?6, ?7)",
            )?
            .execute(params![
                exchange.as_str(),
                market_id,
                interval.as_str(),
                to_millis(open_time),
                price.to_string(),
                to_millis(trade_timestamp),
                quantity.to_string(),
            ])?;

        if inserted == 0 {
            let (high, low, volume, close, close_time): (String, String, String, String, i64) = tx
                .prepare_cached(
                    "SELECT high, low, volume, close, close_time FROM candles
                     WHERE exchange = ?1 AND market_id = ?2 AND interval = ?3 AND open_time = ?4",
                )?
                .query_row(
                    params![exchange.as_str(), market_id, interval.as_str(), to_millis(open_time)],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )?;

            let high = decimal_from_col(&high)?.max(price);
            let low = decimal_from_col(&low)?.min(price);
            let volume = decimal_from_col(&volume)? + quantity;

            // Strict "close = latest-by-timestamp" semantics: only move
            // close/close_time forward when this trade is not older than
            // whichever trade last set it. See `Candle::close_time`.
            let (close, close_time) = if to_millis(trade_timestamp) >= close_time {
                (price, to_millis(trade_timestamp))
            } else {
                (decimal_from_col(&close)?, close_time)
            };

            tx.prepare_cached(
                "UPDATE candles SET high = ?1, low = ?2, volume = ?3, close = ?4, close_time = ?5
                 WHERE exchange = ?6 AND market_id = ?7 AND interval = ?8 AND open_time = ?9",
            )?
            .execute(params![
                high.to_string(),
                low.to_string(),
                volume.to_string(),
                close.to_string(),
                close_time,
                exchange.as_str(),
                market_id,
                interval.as_str(),
                to_millis(open_time),
            ])?;
        }

        tx.commit()?;
        Ok(())
    }

    fn query_candles(
        &self,
        exchange: Exchange,
        market_id: &str,
        interval: Interval,
        query: CandleQuery,
    ) -> Result<Vec<Candle>, StorageError> {
        let conn = self.conn.lock();
        let start = query.start.map(to_millis).unwrap_or(i64::MIN);
        let end = query.end.map(to_millis).unwrap_or(i64::MAX);
        let limit = query.limit.max(1);

        let mut stmt = conn.prepare_cached(
            "SELECT exchange, market_id, interval, open_time, open, high, low, close, close_time, volume
             FROM candles
             WHERE exchange = ?1 AND market_id = ?2 AND interval = ?3
               AND open_time >= ?4 AND open_time <= ?5
             ORDER BY open_time ASC
             LIMIT ?6",
        )?;

        let rows = stmt.query_map(
            params![exchange.as_str(), market_id, interval.as_str(), start, end, limit],
            Self::row_to_candle,
        )?;

        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    fn query_trades(
        &self,
        exchange: Exchange,
        market_id: &str,
        query: TradeQuery,
    ) -> Result<Vec<Trade>, StorageError> {
        let conn = self.conn.lock();
        let start = query.start.map(to_millis).unwrap_or(i64::MIN);
        let end = query.end.map(to_millis).unwrap_or(i64::MAX);
        let limit = query.limit.max(1);
        let side = query.side.map(|s| s.as_str().to_string());

        let mut stmt = conn.prepare_cached(
            "SELECT id, exchange, market_id, price, quantity, side, timestamp, tx_hash, dedupe_key
             FROM trades
             WHERE exchange = ?1 AND market_id = ?2
               AND timestamp >= ?3 AND timestamp <= ?4
               AND (?5 IS NULL OR side = ?5)
             ORDER BY timestamp DESC
             LIMIT ?6",
        )?;

        let rows = stmt.query_map(
            params![exchange.as_str(), market_id, start, end, side, limit],
            Self::row_to_trade,
        )?;

        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    fn latest_trades(
        &self,
        exchange: Option<Exchange>,
        limit: u32,
    ) -> Result<Vec<Trade>, StorageError> {
        let conn = self.conn.lock();
        let exchange_filter = exchange.map(|e| e.as_str().to_string());
        let limit = limit.max(1);

        let mut stmt = conn.prepare_cached(
            "SELECT id, exchange, market_id, price, quantity, side, timestamp, tx_hash, dedupe_key
             FROM trades
             WHERE (?1 IS NULL OR exchange = ?1)
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![exchange_filter, limit], Self::row_to_trade)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    fn markets_with_trades(
        &self,
        exchange: Option<Exchange>,
    ) -> Result<Vec<MarketSummary>, StorageError> {
        let conn = self.conn.lock();
        let exchange_filter = exchange.map(|e| e.as_str().to_string());
        let window_start = to_millis(Utc::now()) - 10 * 60 * 1000;

        let mut stmt = conn.prepare_cached(
            "SELECT exchange, market_id,
                    COUNT(*) AS trade_count,
                    SUM(CASE WHEN timestamp >= ?2 THEN 1 ELSE 0 END) AS recent_count,
                    MAX(timestamp) AS last_trade_at
             FROM trades
             WHERE (?1 IS NULL OR exchange = ?1)
             GROUP BY exchange, market_id
             ORDER BY recent_count DESC, trade_count DESC",
        )?;

        let rows = stmt.query_map(params![exchange_filter, window_start], |row| {
            let exchange: String = row.get(0)?;
            let last_trade_at: i64 = row.get(4)?;
            Ok(MarketSummary {
                exchange: exchange.parse().unwrap_or(Exchange::Kalshi),
                market_id: row.get(1)?,
                trade_count: row.get::<_, i64>(2)? as u64,
                trades_last_10m: row.get::<_, i64>(3)? as u64,
                last_trade_at: from_millis(last_trade_at),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    fn backfill_candles(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        for interval in Interval::ALL {
            let interval_ms: i64 = match interval {
                Interval::OneSecond => 1_000,
                Interval::OneMinute => 60_000,
                Interval::OneHour => 3_600_000,
            };

            // Set-oriented rebuild: group persisted trades by
            // (exchange, market_id, bucket) and derive open/high/low/close/volume
            // in one pass. `close` picks the latest-by-timestamp row (ties by
            // rowid, i.e. insertion order) to match upsert_candle's semantics.
            let mut stmt = conn.prepare_cached(
                "SELECT exchange, market_id,
                        (timestamp / ?1) * ?1 AS open_time,
                        price, quantity, timestamp, id
                 FROM trades
                 ORDER BY exchange, market_id, open_time, timestamp ASC, id ASC",
            )?;

            let mut buckets: std::collections::BTreeMap<(String, String, i64), BucketAcc> =
                std::collections::BTreeMap::new();

            let rows = stmt.query_map(params![interval_ms], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;

            for row in rows {
                let (exchange, market_id, open_time, price, quantity, timestamp) = row?;
                let price = decimal_from_col(&price)?;
                let quantity = decimal_from_col(&quantity)?;

                buckets
                    .entry((exchange, market_id, open_time))
                    .and_modify(|acc| acc.fold(price, quantity, timestamp))
                    .or_insert_with(|| BucketAcc::new(price, quantity, timestamp));
            }

            let mut upsert = conn.prepare_cached(
                "INSERT INTO candles
                    (exchange, market_id, interval, open_time, open, high, low, close, close_time, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(exchange, market_id, interval, open_time) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    close_time = excluded.close_time,
                    volume = excluded.volume",
            )?;

            for ((exchange, market_id, open_time), acc) in buckets {
                upsert.execute(params![
                    exchange,
                    market_id,
                    interval.as_str(),
                    open_time,
                    acc.open.to_string(),
                    acc.high.to_string(),
                    acc.low.to_string(),
                    acc.close.to_string(),
                    acc.close_time,
                    acc.volume.to_string(),
                ])?;
            }
        }

        Ok(())
    }

    fn is_reachable(&self) -> bool {
        self.conn.lock().execute_batch("SELECT 1").is_ok()
    }
}

struct BucketAcc {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    close_time: i64,
    volume: Decimal,
}

impl BucketAcc {
    fn new(price: Decimal, quantity: Decimal, timestamp: i64) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            close_time: timestamp,
            volume: quantity,
        }
    }

    fn fold(&mut self, price: Decimal, quantity: Decimal, timestamp: i64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += quantity;
        if timestamp >= self.close_time {
            self.close = price;
            self.close_time = timestamp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use rust_decimal_macros::dec;

    fn trade(market_id: &str, price: Decimal, quantity: Decimal, ts: DateTime<Utc>, dedupe: &str) -> Trade {
        Trade {
            id: None,
            exchange: Exchange::Kalshi,
            market_id: market_id.to_string(),
            price,
            quantity,
            side: Side::Buy,
            timestamp: ts,
            tx_hash: None,
            dedupe_key: dedupe.to_string(),
        }
    }

    #[test]
    fn insert_trade_is_idempotent() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let t = trade("M", dec!(0.5), dec!(10), Utc::now(), "dup-1");

        assert!(matches!(storage.insert_trade(&t).unwrap(), InsertOutcome::Inserted(_)));
        assert_eq!(storage.insert_trade(&t).unwrap(), InsertOutcome::Duplicate);

        let trades = storage
            .query_trades(Exchange::Kalshi, "M", TradeQuery { limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[test]
    fn upsert_candle_tracks_ohlcv() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap();

        storage
            .upsert_candle(Exchange::Kalshi, "M", Interval::OneMinute, base, dec!(0.50), dec!(1), base)
            .unwrap();
        storage
            .upsert_candle(
                Exchange::Kalshi,
                "M",
                Interval::OneMinute,
                base,
                dec!(0.60),
                dec!(2),
                base + chrono::Duration::seconds(5),
            )
            .unwrap();
        storage
            .upsert_candle(
                Exchange::Kalshi,
                "M",
                Interval::OneMinute,
                base,
                dec!(0.45),
                dec!(3),
                base + chrono::Duration::seconds(10),
            )
            .unwrap();
        storage
            .upsert_candle(
                Exchange::Kalshi,
                "M",
                Interval::OneMinute,
                base,
                dec!(0.55),
                dec!(4),
                base + chrono::Duration::seconds(15),
            )
            .unwrap();

        let candles = storage
            .query_candles(Exchange::Kalshi, "M", Interval::OneMinute, CandleQuery { limit: 10, ..Default::default() })
            .unwrap();

        assert_eq!(candles.len(), 1);
        let c = &candles[0];
        assert_eq!(c.open, dec!(0.50));
        assert_eq!(c.high, dec!(0.60));
        assert_eq!(c.low, dec!(0.45));
        assert_eq!(c.close, dec!(0.55));
        assert_eq!(c.volume, dec!(10));
        assert!(c.invariants_hold());
    }

    #[test]
    fn close_respects_trade_timestamp_not_arrival_order() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        // Later trade (by timestamp) arrives first.
        storage
            .upsert_candle(
                Exchange::Kalshi,
                "M",
                Interval::OneMinute,
                base,
                dec!(0.70),
                dec!(1),
                base + chrono::Duration::seconds(30),
            )
            .unwrap();
        // Earlier trade arrives second; close must not move backward.
        storage
            .upsert_candle(Exchange::Kalshi, "M", Interval::OneMinute, base, dec!(0.40), dec!(1), base)
            .unwrap();

        let candles = storage
            .query_candles(Exchange::Kalshi, "M", Interval::OneMinute, CandleQuery { limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(candles[0].close, dec!(0.70));
    }

    #[test]
    fn backfill_is_idempotent() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        for (i, price) in [dec!(0.5), dec!(0.6), dec!(0.4)].into_iter().enumerate() {
            let t = trade("M", price, dec!(1), base + chrono::Duration::seconds(i as i64), &format!("d{i}"));
            storage.insert_trade(&t).unwrap();
        }

        storage.backfill_candles().unwrap();
        let first = storage
            .query_candles(Exchange::Kalshi, "M", Interval::OneHour, CandleQuery { limit: 10, ..Default::default() })
            .unwrap();

        storage.backfill_candles().unwrap();
        let second = storage
            .query_candles(Exchange::Kalshi, "M", Interval::OneHour, CandleQuery { limit: 10, ..Default::default() })
            .unwrap();

        assert_eq!(first, second);
    }
}
