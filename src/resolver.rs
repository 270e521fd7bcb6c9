//! Market-title resolution: out of scope as a concrete implementation (it
//! would call an upstream REST API off the hot path), but the core requires
//! a resolver to exist at this interface.

use async_trait::async_trait;

use crate::models::Exchange;

#[async_trait]
pub trait MarketTitleResolver: Send + Sync {
    async fn resolve_title(&self, exchange: Exchange, market_id: &str) -> Option<String>;
}

/// Default resolver: never blocks, never calls out. A concrete
/// HTTP-backed resolver can implement the same trait without touching
/// any other component.
pub struct NoopResolver;

#[async_trait]
impl MarketTitleResolver for NoopResolver {
    async fn resolve_title(&self, _exchange: Exchange, _market_id: &str) -> Option<String> {
        None
    }
}
