//! End-to-end pipeline scenarios: ingestion -> storage -> aggregation ->
//! fan-out, exercised without going through HTTP or a live upstream.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use marketpulse_backend::aggregator::CandleAggregator;
use marketpulse_backend::bus::TradeBus;
use marketpulse_backend::error::InsertOutcome;
use marketpulse_backend::models::{Exchange, Interval, Side, Trade};
use marketpulse_backend::storage::{CandleQuery, SqliteStorage, StorageGateway};
use marketpulse_backend::ws::Hub;
use rust_decimal_macros::dec;

/// Mirrors `CandleAggregator::apply` (private to the crate): upserts all
/// three interval candles for one trade. Kept here rather than exposed
/// publicly since production code only ever drives this via the bus.
fn apply_to_all_intervals(storage: &SqliteStorage, t: &Trade) {
    for interval in Interval::ALL {
        storage
            .upsert_candle(t.exchange, &t.market_id, interval, interval.truncate(t.timestamp), t.price, t.quantity, t.timestamp)
            .unwrap();
    }
}

fn trade(market_id: &str, price: rust_decimal::Decimal, quantity: rust_decimal::Decimal, ts: chrono::DateTime<Utc>, dedupe: &str) -> Trade {
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

/// S1 — a single trade produces exactly one candle at each of the three
/// resolutions, each reflecting that trade alone.
#[tokio::test]
async fn single_trade_yields_three_candles() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let bus = TradeBus::new();

    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap() + chrono::Duration::milliseconds(789);
    let t = trade("M", dec!(0.55), dec!(10), ts, "kalshi:M:1");

    assert_eq!(storage.insert_trade(&t).unwrap(), InsertOutcome::Inserted(1));
    let sub = bus.subscribe();
    bus.publish(t.clone());
    let received = sub.recv().await;
    assert_eq!(received.dedupe_key, t.dedupe_key);

    apply_to_all_intervals(&storage, &t);
    for interval in Interval::ALL {
        let candles = storage
            .query_candles(Exchange::Kalshi, "M", interval, CandleQuery { limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open, dec!(0.55));
        assert_eq!(candles[0].high, dec!(0.55));
        assert_eq!(candles[0].low, dec!(0.55));
        assert_eq!(candles[0].close, dec!(0.55));
        assert_eq!(candles[0].volume, dec!(10));
    }
}

/// S3 — inserting the same (exchange-specific) dedupe key twice yields one
/// row and the candle reflects exactly one trade's quantity.
#[tokio::test]
async fn duplicate_trade_does_not_double_count_volume() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());

    let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let t = trade("M", dec!(0.5), dec!(10), ts, "0xabc:3");

    assert!(matches!(storage.insert_trade(&t).unwrap(), InsertOutcome::Inserted(_)));
    apply_to_all_intervals(&storage, &t);

    assert_eq!(storage.insert_trade(&t).unwrap(), InsertOutcome::Duplicate);
    // A duplicate insert must never reach the aggregator in the real
    // pipeline (the ingester only publishes on `Inserted`); simulate that
    // contract directly rather than re-applying.

    let candles = storage
        .query_candles(Exchange::Kalshi, "M", Interval::OneMinute, CandleQuery { limit: 10, ..Default::default() })
        .unwrap();
    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].volume, dec!(10));
}

/// S4 — fan-out respects each connection's independent subscription set.
#[tokio::test]
async fn hub_fan_out_respects_subscriptions() {
    let hub = Hub::new();
    let (a, a_out) = hub.register();
    let (b, b_out) = hub.register();
    let (c, c_out) = hub.register();

    hub.subscribe(a, Exchange::Kalshi, "X");
    hub.subscribe(b, Exchange::Kalshi, "X");
    hub.subscribe(b, Exchange::Polymarket, "Y");
    hub.subscribe(c, Exchange::Polymarket, "Y");

    let kalshi_trade = trade("X", dec!(0.5), dec!(1), Utc::now(), "k1");
    let mut poly_trade = trade("Y", dec!(0.5), dec!(1), Utc::now(), "p1");
    poly_trade.exchange = Exchange::Polymarket;

    hub.dispatch(&kalshi_trade);
    assert!(a_out.recv().await.is_some());
    assert!(b_out.recv().await.is_some());

    hub.dispatch(&poly_trade);
    assert!(b_out.recv().await.is_some());
    assert!(c_out.recv().await.is_some());

    hub.close(a);
    hub.close(b);
    hub.close(c);
    assert_eq!(hub.connection_count(), 0);
}

/// S6 — backfill after a simulated restart reproduces the candles that
/// incremental aggregation produced before "shutdown".
#[tokio::test]
async fn backfill_matches_pre_restart_aggregation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let bus = TradeBus::new();

    let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    for i in 0..100i64 {
        let t = trade(
            "M",
            dec!(0.4) + rust_decimal::Decimal::new(i % 20, 2),
            dec!(1),
            base + chrono::Duration::seconds(i),
            &format!("kalshi:M:{i}"),
        );
        storage.insert_trade(&t).unwrap();
        apply_to_all_intervals(&storage, &t);
    }

    let pre_restart = storage
        .query_candles(Exchange::Kalshi, "M", Interval::OneHour, CandleQuery { limit: 100, ..Default::default() })
        .unwrap();

    // Simulate restart: a fresh aggregator over the same storage, backfilling
    // from persisted trades only.
    let aggregator_after_restart = CandleAggregator::new(storage.clone(), bus.clone());
    aggregator_after_restart.backfill().unwrap();

    let post_restart = storage
        .query_candles(Exchange::Kalshi, "M", Interval::OneHour, CandleQuery { limit: 100, ..Default::default() })
        .unwrap();

    assert_eq!(pre_restart, post_restart);
}

/// S6 (disk-backed) — trades persisted before a real process restart are
/// still there, and a fresh `SqliteStorage` handle over the same file
/// backfills the same candles the first process had computed incrementally.
#[test]
fn disk_backed_storage_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("marketpulse.db");
    let db_path = db_path.to_str().unwrap();

    let base = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let pre_restart = {
        let storage = SqliteStorage::open(db_path).unwrap();
        for i in 0..10i64 {
            let t = trade("M", dec!(0.5), dec!(1), base + chrono::Duration::seconds(i), &format!("kalshi:M:{i}"));
            storage.insert_trade(&t).unwrap();
            apply_to_all_intervals(&storage, &t);
        }
        storage
            .query_candles(Exchange::Kalshi, "M", Interval::OneMinute, CandleQuery { limit: 10, ..Default::default() })
            .unwrap()
    };

    // Simulate the process exiting and a new one opening the same file.
    let storage = SqliteStorage::open(db_path).unwrap();
    let trades = storage
        .query_trades(Exchange::Kalshi, "M", marketpulse_backend::storage::TradeQuery { limit: 10, ..Default::default() })
        .unwrap();
    assert_eq!(trades.len(), 10);

    storage.backfill_candles().unwrap();
    let post_restart = storage
        .query_candles(Exchange::Kalshi, "M", Interval::OneMinute, CandleQuery { limit: 10, ..Default::default() })
        .unwrap();

    assert_eq!(pre_restart, post_restart);
}
