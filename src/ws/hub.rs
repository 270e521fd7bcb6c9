//! Subscription-indexed dispatcher. `tokio::sync::broadcast` is deliberately
//! not used here: it fans out to every receiver and cannot express
//! per-connection drop-oldest backpressure or O(subscribers) lookup by
//! `(exchange, marketId)` — both hard requirements.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::models::{Exchange, Trade};

use super::connection::ServerFrame;

pub type ConnId = u64;

const OUTBOUND_CAPACITY: usize = 256;
/// A connection is closed for abuse once its drop count exceeds this within
/// its lifetime; normal-rate drops (one slow burst) stay under it.
const ABUSE_DROP_THRESHOLD: u64 = 1000;

pub(crate) struct OutboundQueue {
    queue: Mutex<VecDeque<ServerFrame>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

impl OutboundQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(OUTBOUND_CAPACITY)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn push(&self, frame: ServerFrame) {
        let mut queue = self.queue.lock();
        if queue.len() >= OUTBOUND_CAPACITY {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
    }

    /// Drains any queued frames (e.g. a server-error frame pushed just
    /// before `close`) before honoring the closed flag, so a close never
    /// silently swallows a frame already in the mailbox.
    pub(crate) async fn recv(&self) -> Option<ServerFrame> {
        loop {
            {
                let mut queue = self.queue.lock();
                if let Some(frame) = queue.pop_front() {
                    return Some(frame);
                }
            }
            if self.closed.load(Ordering::Relaxed) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

struct ConnectionEntry {
    outbound: Arc<OutboundQueue>,
    subscriptions: HashSet<(Exchange, String)>,
}

/// Routes trades from the bus to subscribed connections, and exposes the
/// per-connection subscribe/unsubscribe/close API the WS handler drives.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Mutex<HubInner>>,
    next_conn_id: Arc<AtomicUsize>,
}

struct HubInner {
    connections: HashMap<ConnId, ConnectionEntry>,
    index: HashMap<(Exchange, String), HashSet<ConnId>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                connections: HashMap::new(),
                index: HashMap::new(),
            })),
            next_conn_id: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn register(&self) -> (ConnId, Arc<OutboundQueue>) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) as ConnId;
        let outbound = Arc::new(OutboundQueue::new());
        self.inner.lock().connections.insert(
            id,
            ConnectionEntry {
                outbound: outbound.clone(),
                subscriptions: HashSet::new(),
            },
        );
        (id, outbound)
    }

    pub fn subscribe(&self, conn_id: ConnId, exchange: Exchange, market_id: &str) {
        let mut inner = self.inner.lock();
        let key = (exchange, market_id.to_string());

        let Some(entry) = inner.connections.get_mut(&conn_id) else {
            return;
        };
        // Subscribing to an already-subscribed market is a no-op.
        if !entry.subscriptions.insert(key.clone()) {
            return;
        }

        inner.index.entry(key).or_default().insert(conn_id);
    }

    pub fn unsubscribe(&self, conn_id: ConnId, exchange: Exchange, market_id: &str) {
        let mut inner = self.inner.lock();
        let key = (exchange, market_id.to_string());

        if let Some(entry) = inner.connections.get_mut(&conn_id) {
            entry.subscriptions.remove(&key);
        }
        if let Some(subs) = inner.index.get_mut(&key) {
            subs.remove(&conn_id);
            if subs.is_empty() {
                inner.index.remove(&key);
            }
        }
    }

    /// Closes the connection and removes every subscription-index entry
    /// pointing at it.
    pub fn close(&self, conn_id: ConnId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.connections.remove(&conn_id) else {
            return;
        };
        entry.outbound.close();
        for key in entry.subscriptions {
            if let Some(subs) = inner.index.get_mut(&key) {
                subs.remove(&conn_id);
                if subs.is_empty() {
                    inner.index.remove(&key);
                }
            }
        }
    }

    /// Dispatches a trade to exactly the connections subscribed to
    /// `(trade.exchange, trade.marketId)` — O(subscribers-for-that-market),
    /// never O(all connections).
    pub fn dispatch(&self, trade: &Trade) {
        let key = (trade.exchange, trade.market_id.clone());
        let to_close: Vec<ConnId>;
        {
            let inner = self.inner.lock();
            let Some(subs) = inner.index.get(&key) else {
                return;
            };
            let frame = ServerFrame::Trade { data: trade.clone() };
            to_close = subs
                .iter()
                .filter_map(|conn_id| {
                    let entry = inner.connections.get(conn_id)?;
                    entry.outbound.push(frame.clone());
                    if entry.outbound.dropped.load(Ordering::Relaxed) > ABUSE_DROP_THRESHOLD {
                        Some(*conn_id)
                    } else {
                        None
                    }
                })
                .collect();
        }
        for conn_id in to_close {
            // Push the server-error frame before closing the queue so the
            // connection task still has a chance to flush it.
            if let Some(entry) = self.inner.lock().connections.get(&conn_id) {
                entry.outbound.push(ServerFrame::Error {
                    message: "closed: dropped-frame rate exceeded".to_string(),
                });
            }
            self.close(conn_id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Closes every connection and clears the subscription index. Used at
    /// shutdown, after ingesters and the aggregator have drained, so no
    /// connection is closed mid-dispatch.
    pub fn close_all(&self) {
        let ids: Vec<ConnId> = self.inner.lock().connections.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn trade(exchange: Exchange, market_id: &str) -> Trade {
        Trade {
            id: None,
            exchange,
            market_id: market_id.to_string(),
            price: dec!(0.5),
            quantity: dec!(1),
            side: Side::Buy,
            timestamp: Utc::now(),
            tx_hash: None,
            dedupe_key: format!("{exchange}:{market_id}"),
        }
    }

    #[tokio::test]
    async fn fan_out_respects_subscriptions() {
        let hub = Hub::new();
        let (a, a_out) = hub.register();
        let (b, b_out) = hub.register();
        let (c, c_out) = hub.register();

        hub.subscribe(a, Exchange::Kalshi, "X");
        hub.subscribe(b, Exchange::Kalshi, "X");
        hub.subscribe(b, Exchange::Polymarket, "Y");
        hub.subscribe(c, Exchange::Polymarket, "Y");

        hub.dispatch(&trade(Exchange::Kalshi, "X"));
        assert!(matches!(a_out.recv().await, Some(ServerFrame::Trade { .. })));
        assert!(matches!(b_out.recv().await, Some(ServerFrame::Trade { .. })));

        hub.dispatch(&trade(Exchange::Polymarket, "Y"));
        assert!(matches!(b_out.recv().await, Some(ServerFrame::Trade { .. })));
        assert!(matches!(c_out.recv().await, Some(ServerFrame::Trade { .. })));

        hub.close(a);
        hub.close(b);
        hub.close(c);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let hub = Hub::new();
        let (a, _) = hub.register();
        hub.subscribe(a, Exchange::Kalshi, "X");
        hub.subscribe(a, Exchange::Kalshi, "X");

        hub.dispatch(&trade(Exchange::Kalshi, "X"));
        // Only one subscription entry, regardless of duplicate subscribe calls.
        assert_eq!(hub.inner.lock().index[&(Exchange::Kalshi, "X".to_string())].len(), 1);
    }

    #[tokio::test]
    async fn close_cleans_up_index() {
        let hub = Hub::new();
        let (a, _) = hub.register();
        hub.subscribe(a, Exchange::Kalshi, "X");
        hub.close(a);
        assert!(hub.inner.lock().index.is_empty());
        assert_eq!(hub.connection_count(), 0);
    }
}
