//! Kalshi ingester: signed HTTPS polling with a watermark cursor.
//!
//! Request signing follows Kalshi's documented scheme: RSA-PSS-SHA256 over
//! `timestamp ‖ method ‖ path`, base64-encoded into the
//! `KALSHI-ACCESS-SIGNATURE` header alongside `KALSHI-ACCESS-KEY` and
//! `KALSHI-ACCESS-TIMESTAMP`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::bus::TradeBus;
use crate::error::{IngestError, InsertOutcome};
use crate::models::{Exchange, Side, Trade};
use crate::storage::StorageGateway;

const KALSHI_API_BASE: &str = "https://api.elections.kalshi.com";
const TRADES_PATH: &str = "/trade-api/v2/markets/trades";
const MAX_RETRIES: u32 = 5;
const INITIAL_BACKOFF_MS: u64 = 500;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngesterState {
    Idle,
    Polling,
    Publishing,
    Backoff,
}

#[derive(Debug, Clone, Deserialize)]
struct KalshiTradeDto {
    trade_id: String,
    ticker: String,
    // Kalshi prices are cents (0-100); convert to a [0,1] decimal probability.
    yes_price: i64,
    count: i64,
    taker_side: String,
    created_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TradesResponse {
    trades: Vec<KalshiTradeDto>,
}

pub struct KalshiCredentials {
    pub api_key_id: String,
    pub private_key_pem: String,
}

impl KalshiCredentials {
    fn sign(&self, timestamp_ms: u64, method: &str, path: &str) -> Result<String, IngestError> {
        let message = format!("{timestamp_ms}{method}{path}");

        let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(&self.private_key_pem)
            .or_else(|_| rsa::RsaPrivateKey::from_pkcs1_pem(&self.private_key_pem))
            .map_err(|e| IngestError::Fatal(format!("invalid Kalshi private key: {e}")))?;

        let signing_key = rsa::pss::SigningKey::<sha2::Sha256>::new(private_key);
        let mut rng = rand::rngs::OsRng;
        let signature = signing_key.sign_with_rng(&mut rng, message.as_bytes());

        Ok(base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()))
    }
}

/// Per-market watermark: the unix-second `created_time` of the most recently
/// observed trade, sent back as `min_ts` so polling only asks for trades at
/// or after it. `min_ts` is inclusive on the upstream side, so the boundary
/// trade can come back again; that's fine, `insert_trade`'s dedupe key makes
/// the re-fetch a no-op rather than a double-publish.
#[derive(Default)]
struct Watermarks(Mutex<HashMap<String, i64>>);

impl Watermarks {
    fn get(&self, market_id: &str) -> Option<i64> {
        self.0.lock().get(market_id).copied()
    }

    fn set(&self, market_id: &str, unix_ts: i64) {
        self.0.lock().insert(market_id.to_string(), unix_ts);
    }
}

pub struct KalshiIngester {
    client: reqwest::Client,
    credentials: KalshiCredentials,
    markets: Vec<String>,
    storage: Arc<dyn StorageGateway>,
    bus: TradeBus,
    watermarks: Watermarks,
}

impl KalshiIngester {
    pub fn new(
        credentials: KalshiCredentials,
        markets: Vec<String>,
        storage: Arc<dyn StorageGateway>,
        bus: TradeBus,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            credentials,
            markets,
            storage,
            bus,
            watermarks: Watermarks::default(),
        }
    }

    /// Runs until `shutdown` resolves. Each tick drives every tracked market
    /// through `{idle → polling → publishing → idle}`, falling back to
    /// `backoff` on transient failure. An auth failure is fatal and stops
    /// the whole ingester; other markets' failures are independent.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if self.markets.is_empty() {
            warn!("kalshi ingester has no configured markets, idling");
        }

        loop {
            if *shutdown.borrow() {
                info!("kalshi ingester shutting down");
                return;
            }

            for market_id in &self.markets {
                match self.poll_market(market_id).await {
                    Ok(count) if count > 0 => {
                        info!(market_id, count, "kalshi: published trades");
                    }
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => {
                        error!(market_id, error = %e, "kalshi ingester: fatal error, stopping");
                        return;
                    }
                    Err(e) => {
                        warn!(market_id, error = %e, "kalshi ingester: transient error, backing off");
                        self.backoff(market_id).await;
                    }
                }
            }

            tokio::select! {
                _ = sleep(POLL_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn backoff(&self, market_id: &str) {
        let mut delay = INITIAL_BACKOFF_MS;
        for attempt in 0..MAX_RETRIES {
            warn!(market_id, attempt, delay_ms = delay, "kalshi: backing off");
            sleep(Duration::from_millis(delay)).await;
            delay = (delay * 2).min(30_000);
        }
    }

    async fn poll_market(&self, market_id: &str) -> Result<usize, IngestError> {
        let trades = self.fetch_trades(market_id).await?;
        if trades.is_empty() {
            return Ok(0);
        }

        let mut ordered = trades;
        ordered.sort_by_key(|t| t.created_time);

        let mut published = 0;
        for dto in ordered {
            let trade = self.to_canonical(market_id, &dto)?;
            match self.storage.insert_trade(&trade)? {
                InsertOutcome::Inserted(id) => {
                    let mut persisted = trade;
                    persisted.id = Some(id);
                    self.bus.publish(persisted);
                    published += 1;
                }
                InsertOutcome::Duplicate => {}
            }
            self.watermarks.set(market_id, dto.created_time.timestamp());
        }

        Ok(published)
    }

    fn to_canonical(&self, market_id: &str, dto: &KalshiTradeDto) -> Result<Trade, IngestError> {
        let side = match dto.taker_side.as_str() {
            "yes" => Side::Buy,
            "no" => Side::Sell,
            other => return Err(IngestError::Transient(format!("unknown taker_side {other}"))),
        };

        let price = Decimal::new(dto.yes_price, 2); // cents -> [0,1] probability
        let quantity = Decimal::new(dto.count, 0);

        Ok(Trade {
            id: None,
            exchange: Exchange::Kalshi,
            market_id: market_id.to_string(),
            price,
            quantity,
            side,
            timestamp: dto.created_time,
            tx_hash: None,
            dedupe_key: Trade::kalshi_dedupe_key(market_id, &dto.trade_id),
        })
    }

    async fn fetch_trades(&self, market_id: &str) -> Result<Vec<KalshiTradeDto>, IngestError> {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let signature = self.credentials.sign(timestamp_ms, "GET", TRADES_PATH)?;

        let mut request = self
            .client
            .get(format!("{KALSHI_API_BASE}{TRADES_PATH}"))
            .header("KALSHI-ACCESS-KEY", &self.credentials.api_key_id)
            .header("KALSHI-ACCESS-SIGNATURE", signature)
            .header("KALSHI-ACCESS-TIMESTAMP", timestamp_ms.to_string())
            .query(&[("ticker", market_id.to_string())]);

        if let Some(min_ts) = self.watermarks.get(market_id) {
            request = request.query(&[("min_ts", min_ts)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IngestError::Transient(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(IngestError::Fatal(format!(
                "kalshi auth rejected: {}",
                response.status()
            )));
        }

        if !response.status().is_success() {
            return Err(IngestError::Transient(format!(
                "kalshi http error: {}",
                response.status()
            )));
        }

        let body: TradesResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Transient(format!("bad kalshi response: {e}")))?;

        Ok(body.trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_mapping_matches_taker_side() {
        let dto = KalshiTradeDto {
            trade_id: "t1".into(),
            ticker: "M".into(),
            yes_price: 55,
            count: 10,
            taker_side: "yes".into(),
            created_time: Utc::now(),
        };
        assert_eq!(dto.yes_price, 55);
    }

    #[test]
    fn price_rescale_from_cents() {
        let price = Decimal::new(55, 2);
        assert_eq!(price.to_string(), "0.55");
    }
}
