//! Candle aggregator: consumes the trade bus and maintains OHLCV candles at
//! three resolutions.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::TradeBus;
use crate::models::Interval;
use crate::storage::StorageGateway;

pub struct CandleAggregator {
    storage: Arc<dyn StorageGateway>,
    bus: TradeBus,
}

impl CandleAggregator {
    pub fn new(storage: Arc<dyn StorageGateway>, bus: TradeBus) -> Self {
        Self { storage, bus }
    }

    /// One-shot rebuild of every candle from persisted trades. Must run to
    /// completion before any ingester starts publishing, so backfill never
    /// races a live upsert over the same bucket.
    pub fn backfill(&self) -> anyhow::Result<()> {
        info!("candle aggregator: running startup backfill");
        self.storage.backfill_candles()?;
        info!("candle aggregator: backfill complete");
        Ok(())
    }

    /// Runs until `shutdown` resolves, draining the bus mailbox before
    /// returning so no subscribed trade is silently lost on shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let subscription = self.bus.subscribe();

        loop {
            tokio::select! {
                biased;
                trade = subscription.recv() => {
                    self.apply(&trade);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("candle aggregator: draining before shutdown");
                        return;
                    }
                }
            }
        }
    }

    /// Computes the three bucket open-times for this trade and upserts all
    /// three candles. All three complete before the next trade is handled,
    /// giving per-trade atomicity at the application level.
    fn apply(&self, trade: &crate::models::Trade) {
        for interval in Interval::ALL {
            let open_time = interval.truncate(trade.timestamp);
            if let Err(e) = self.storage.upsert_candle(
                trade.exchange,
                &trade.market_id,
                interval,
                open_time,
                trade.price,
                trade.quantity,
                trade.timestamp,
            ) {
                warn!(
                    exchange = %trade.exchange,
                    market_id = %trade.market_id,
                    interval = interval.as_str(),
                    error = %e,
                    "candle aggregator: upsert failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, Side, Trade};
    use crate::storage::{CandleQuery, SqliteStorage};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn single_trade_produces_three_candles() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let bus = TradeBus::new();
        let aggregator = CandleAggregator::new(storage.clone(), bus.clone());

        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap()
            + chrono::Duration::milliseconds(789);

        let trade = Trade {
            id: Some(1),
            exchange: Exchange::Kalshi,
            market_id: "M".into(),
            price: dec!(0.55),
            quantity: dec!(10),
            side: Side::Buy,
            timestamp: ts,
            tx_hash: None,
            dedupe_key: "M:1".into(),
        };

        aggregator.apply(&trade);

        for interval in Interval::ALL {
            let candles = storage
                .query_candles(
                    Exchange::Kalshi,
                    "M",
                    interval,
                    CandleQuery { limit: 10, ..Default::default() },
                )
                .unwrap();
            assert_eq!(candles.len(), 1);
            let c = &candles[0];
            assert_eq!(c.open, dec!(0.55));
            assert_eq!(c.high, dec!(0.55));
            assert_eq!(c.low, dec!(0.55));
            assert_eq!(c.close, dec!(0.55));
            assert_eq!(c.volume, dec!(10));
        }
    }

    #[tokio::test]
    async fn backfill_matches_live_aggregation() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let bus = TradeBus::new();
        let aggregator = CandleAggregator::new(storage.clone(), bus.clone());

        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap();
        let prices = [dec!(0.50), dec!(0.60), dec!(0.45), dec!(0.55)];
        let quantities = [dec!(1), dec!(2), dec!(3), dec!(4)];

        for (i, (price, quantity)) in prices.iter().zip(quantities.iter()).enumerate() {
            let trade = Trade {
                id: None,
                exchange: Exchange::Kalshi,
                market_id: "M".into(),
                price: *price,
                quantity: *quantity,
                side: Side::Buy,
                timestamp: base + chrono::Duration::seconds(i as i64 * 10),
                tx_hash: None,
                dedupe_key: format!("M:{i}"),
            };
            storage.insert_trade(&trade).unwrap();
            aggregator.apply(&trade);
        }

        let live = storage
            .query_candles(
                Exchange::Kalshi,
                "M",
                Interval::OneMinute,
                CandleQuery { limit: 10, ..Default::default() },
            )
            .unwrap();

        aggregator.backfill().unwrap();

        let backfilled = storage
            .query_candles(
                Exchange::Kalshi,
                "M",
                Interval::OneMinute,
                CandleQuery { limit: 10, ..Default::default() },
            )
            .unwrap();

        assert_eq!(live, backfilled);
    }
}
