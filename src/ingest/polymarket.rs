//! Polymarket ingester: on-chain log subscription over the CTF Exchange
//! contract, decoded into canonical `Trade`s.
//!
//! A connect-and-stream loop with exponential backoff, reset on a clean
//! subscription. Log decoding is a pure, synchronous processor kept separate
//! from the async subscription loop, so decoding logic is unit-testable
//! without a live RPC endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy_sol_types::sol;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::bus::TradeBus;
use crate::error::InsertOutcome;
use crate::models::{Exchange, Side, Trade};
use crate::storage::StorageGateway;

sol! {
    /// Emitted by Polymarket's CTF Exchange on every matched order.
    event OrderFilled(
        bytes32 indexed orderHash,
        address indexed maker,
        address indexed taker,
        uint256 makerAssetId,
        uint256 takerAssetId,
        uint256 makerAmountFilled,
        uint256 takerAmountFilled,
        uint256 fee
    );
}

/// On-chain amounts are scaled by 1e6 (USDC decimals / CTF share decimals).
const ONCHAIN_SCALE: u32 = 6;

/// Pure decoding logic, no I/O. Kept separate from the subscription loop so
/// it can be exercised directly in tests.
pub struct TradeProcessor {
    last_known_block: AtomicU64,
}

impl TradeProcessor {
    pub fn new(start_block: u64) -> Self {
        Self {
            last_known_block: AtomicU64::new(start_block),
        }
    }

    pub fn last_known_block(&self) -> u64 {
        self.last_known_block.load(Ordering::Relaxed)
    }

    /// Decodes one log into a canonical `Trade`, or `None` if it isn't an
    /// `OrderFilled` event this pipeline understands.
    pub fn decode_log(&self, log: &Log, block_timestamp: DateTime<Utc>) -> Option<Trade> {
        let block_number = log.block_number?;
        self.last_known_block.fetch_max(block_number, Ordering::Relaxed);

        let primitive_log = log.inner.clone();
        let decoded = OrderFilled::decode_log(&primitive_log, true).ok()?;

        let tx_hash = log.transaction_hash?;
        let log_index = log.log_index?;

        // `makerAssetId == 0` means the maker posted collateral (USDC) and
        // received the conditional token: a taker buy. Otherwise the maker
        // sold the conditional token: a taker sell.
        let side = if decoded.makerAssetId == U256::ZERO {
            Side::Buy
        } else {
            Side::Sell
        };

        let market_id = if decoded.makerAssetId == U256::ZERO {
            decoded.takerAssetId.to_string()
        } else {
            decoded.makerAssetId.to_string()
        };

        let (price, quantity) = rescale(
            decoded.makerAmountFilled,
            decoded.takerAmountFilled,
            side,
        )?;

        Some(Trade {
            id: None,
            exchange: Exchange::Polymarket,
            market_id,
            price,
            quantity,
            side,
            timestamp: block_timestamp,
            tx_hash: Some(format!("{tx_hash:#x}")),
            dedupe_key: Trade::polymarket_dedupe_key(&format!("{tx_hash:#x}"), log_index),
        })
    }
}

fn rescale(maker_amount: U256, taker_amount: U256, side: Side) -> Option<(Decimal, Decimal)> {
    let maker = u256_to_decimal(maker_amount)?;
    let taker = u256_to_decimal(taker_amount)?;

    let (collateral, shares) = match side {
        Side::Buy => (maker, taker),
        Side::Sell => (taker, maker),
    };

    if shares.is_zero() {
        return None;
    }

    let price = collateral / shares;
    Some((price, shares))
}

fn u256_to_decimal(value: U256) -> Option<Decimal> {
    let as_u128: u128 = value.try_into().ok()?;
    Some(Decimal::from_i128_with_scale(as_u128 as i128, ONCHAIN_SCALE))
}

pub struct PolymarketIngester {
    ws_url: String,
    exchange_contract: Address,
    storage: Arc<dyn StorageGateway>,
    bus: TradeBus,
    processor: TradeProcessor,
}

impl PolymarketIngester {
    pub fn new(
        ws_url: String,
        exchange_contract: Address,
        storage: Arc<dyn StorageGateway>,
        bus: TradeBus,
        start_block: u64,
    ) -> Self {
        Self {
            ws_url,
            exchange_contract,
            storage,
            bus,
            processor: TradeProcessor::new(start_block),
        }
    }

    /// `{connecting → subscribed → reconnecting}`. On reconnect, replays
    /// from the last seen block to cover any gap; the store's dedupe key
    /// absorbs anything already persisted.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut reconnect_delay = Duration::from_secs(1);
        let max_delay = Duration::from_secs(30);

        loop {
            if *shutdown.borrow() {
                info!("polymarket ingester shutting down");
                return;
            }

            info!(
                from_block = self.processor.last_known_block(),
                "polymarket: connecting"
            );

            match self.connect_and_stream(&mut shutdown).await {
                Ok(()) => {
                    reconnect_delay = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, "polymarket: stream ended, reconnecting");
                    sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(max_delay);
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let ws = WsConnect::new(&self.ws_url);
        let provider = ProviderBuilder::new().on_ws(ws).await?;

        let filter = Filter::new()
            .address(self.exchange_contract)
            .event_signature(OrderFilled::SIGNATURE_HASH)
            .from_block(self.processor.last_known_block());

        let subscription = provider.subscribe_logs(&filter).await?;
        info!("polymarket: subscribed to OrderFilled logs");
        let mut stream = subscription.into_stream();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                log = stream.next() => {
                    let Some(log) = log else {
                        return Err(anyhow::anyhow!("polymarket log stream ended"));
                    };
                    self.handle_log(&provider, log).await?;
                }
            }
        }
    }

    async fn handle_log(&self, provider: &impl Provider, log: Log) -> anyhow::Result<()> {
        let block_timestamp = match log.block_number {
            Some(number) => fetch_block_timestamp(provider, number).await.unwrap_or_else(Utc::now),
            None => Utc::now(),
        };

        let Some(trade) = self.processor.decode_log(&log, block_timestamp) else {
            return Ok(());
        };

        match self.storage.insert_trade(&trade) {
            Ok(InsertOutcome::Inserted(id)) => {
                let mut persisted = trade;
                persisted.id = Some(id);
                self.bus.publish(persisted);
            }
            Ok(InsertOutcome::Duplicate) => {
                // Reorgs would show up here with a stale block number; we
                // log and move on rather than attempt a rewrite (non-goal).
                warn!(dedupe_key = %trade.dedupe_key, "polymarket: duplicate trade, possible reorg replay");
            }
            Err(e) => {
                warn!(error = %e, "polymarket: storage error on trade insert");
            }
        }

        Ok(())
    }
}

async fn fetch_block_timestamp(provider: &impl Provider, block_number: u64) -> anyhow::Result<DateTime<Utc>> {
    let block = provider
        .get_block_by_number(block_number.into())
        .await?
        .ok_or_else(|| anyhow::anyhow!("block {block_number} not found"))?;

    Ok(Utc
        .timestamp_opt(block.header.timestamp as i64, 0)
        .single()
        .unwrap_or_else(Utc::now))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_buy_divides_collateral_by_shares() {
        // maker posts 50 USDC (collateral), taker receives 100 shares -> price 0.50
        let maker = U256::from(50_000_000u64);
        let taker = U256::from(100_000_000u64);
        let (price, quantity) = rescale(maker, taker, Side::Buy).unwrap();
        assert_eq!(price.to_string(), "0.5");
        assert_eq!(quantity.to_string(), "100");
    }

    #[test]
    fn rescale_rejects_zero_shares() {
        assert!(rescale(U256::ZERO, U256::ZERO, Side::Buy).is_none());
    }
}
