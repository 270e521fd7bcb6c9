//! In-memory performance tracker: per-exchange totals, a rolling 60s
//! window, and a bounded tail of latency samples. Pure observer — never on
//! the hot path's critical section beyond an uncontended lock.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::Exchange;

const WINDOW: chrono::Duration = chrono::Duration::seconds(60);
const MAX_SAMPLES: usize = 1000;

#[derive(Default)]
struct ExchangeCounters {
    total: u64,
    recent: VecDeque<DateTime<Utc>>,
    latency_samples_ms: VecDeque<i64>,
}

pub struct PerformanceTracker {
    kalshi: Mutex<ExchangeCounters>,
    polymarket: Mutex<ExchangeCounters>,
}

#[derive(Debug, Serialize)]
pub struct ExchangeSnapshot {
    pub total: u64,
    pub trades_last_60s: u64,
    pub avg_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub kalshi: ExchangeSnapshot,
    pub polymarket: ExchangeSnapshot,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            kalshi: Mutex::new(ExchangeCounters::default()),
            polymarket: Mutex::new(ExchangeCounters::default()),
        }
    }

    /// Records one trade's indexing latency. `source_timestamp` is the
    /// trade's own timestamp; `indexed_at` is wall-clock now.
    pub fn record(&self, exchange: Exchange, source_timestamp: DateTime<Utc>, indexed_at: DateTime<Utc>) {
        let latency_ms = (indexed_at - source_timestamp).num_milliseconds();
        let counters = self.counters_for(exchange);
        let mut counters = counters.lock();

        counters.total += 1;
        counters.recent.push_back(indexed_at);
        prune_window(&mut counters.recent, indexed_at);

        counters.latency_samples_ms.push_back(latency_ms);
        if counters.latency_samples_ms.len() > MAX_SAMPLES {
            counters.latency_samples_ms.pop_front();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            kalshi: snapshot_of(&self.kalshi),
            polymarket: snapshot_of(&self.polymarket),
        }
    }

    fn counters_for(&self, exchange: Exchange) -> &Mutex<ExchangeCounters> {
        match exchange {
            Exchange::Kalshi => &self.kalshi,
            Exchange::Polymarket => &self.polymarket,
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn prune_window(recent: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    while let Some(&front) = recent.front() {
        if now - front > WINDOW {
            recent.pop_front();
        } else {
            break;
        }
    }
}

fn snapshot_of(counters: &Mutex<ExchangeCounters>) -> ExchangeSnapshot {
    let now = Utc::now();
    let mut counters = counters.lock();
    prune_window(&mut counters.recent, now);

    let avg_latency_ms = if counters.latency_samples_ms.is_empty() {
        None
    } else {
        let sum: i64 = counters.latency_samples_ms.iter().sum();
        Some(sum as f64 / counters.latency_samples_ms.len() as f64)
    };

    let p99_latency_ms = if counters.latency_samples_ms.is_empty() {
        None
    } else {
        let mut sorted: Vec<i64> = counters.latency_samples_ms.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.99).floor() as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    };

    ExchangeSnapshot {
        total: counters.total,
        trades_last_60s: counters.recent.len() as u64,
        avg_latency_ms,
        p99_latency_ms,
    }
}
