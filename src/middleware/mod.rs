//! HTTP middleware for observability.
//!
//! - Request logging with latency tracking, matching the span shape the
//!   ingesters and aggregator use for their own structured logs.

pub mod logging;

pub use logging::{request_logging, request_logging_simple};
