//! Prediction-market trade pipeline: ingestion, aggregation, and fan-out.
//!
//! The binary (`src/main.rs`) is thin wiring over this library so that
//! integration tests under `tests/` can exercise the pipeline without
//! going through HTTP.

pub mod aggregator;
pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod ingest;
pub mod middleware;
pub mod models;
pub mod performance;
pub mod resolver;
pub mod storage;
pub mod ws;

use std::sync::Arc;

use crate::bus::TradeBus;
use crate::performance::PerformanceTracker;
use crate::resolver::MarketTitleResolver;
use crate::storage::StorageGateway;
use crate::ws::Hub;

/// Shared application state, cloned into every axum handler and WS
/// connection task. All fields are cheap to clone (`Arc`/channel handles).
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn StorageGateway>,
    pub bus: TradeBus,
    pub hub: Hub,
    pub performance: Arc<PerformanceTracker>,
    pub resolver: Arc<dyn MarketTitleResolver>,
}
