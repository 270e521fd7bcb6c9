//! Ingestion adapters: translate each upstream into canonical `Trade`s.

pub mod kalshi;
pub mod polymarket;

pub use kalshi::{KalshiCredentials, KalshiIngester};
pub use polymarket::PolymarketIngester;
