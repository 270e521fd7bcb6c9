//! In-process trade event bus: many-to-many dispatch with per-subscriber
//! bounded mailboxes and backpressure isolation.
//!
//! `tokio::sync::broadcast` was considered and rejected: it delivers every
//! event to every subscriber and lags the whole channel on overflow, which
//! cannot express "drop the oldest message for *this* slow subscriber only"
//! or O(subscribers-for-a-market) fan-out. Each subscriber here gets its own
//! bounded deque instead.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::models::Trade;

const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

struct Mailbox {
    queue: Mutex<VecDeque<Trade>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking publish. Drops the oldest queued trade on overflow.
    fn push(&self, trade: Trade) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(trade);
        drop(queue);
        self.notify.notify_one();
    }

    async fn recv(&self) -> Trade {
        loop {
            {
                let mut queue = self.queue.lock();
                if let Some(trade) = queue.pop_front() {
                    return trade;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Handle returned to a subscriber. Dropping it does not unsubscribe; call
/// [`TradeBus::unsubscribe`] explicitly so the bus can reclaim the mailbox.
pub struct Subscription {
    id: u64,
    bus: TradeBus,
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&self) -> Trade {
        self.mailbox.recv().await
    }

    pub fn dropped_count(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    pub fn unsubscribe(&self) {
        self.bus.unsubscribe(self.id);
    }
}

#[derive(Clone)]
pub struct TradeBus {
    inner: Arc<Mutex<BusInner>>,
    mailbox_capacity: usize,
}

struct BusInner {
    next_id: u64,
    subscribers: HashMap<u64, Arc<Mailbox>>,
}

impl TradeBus {
    pub fn new() -> Self {
        Self::with_mailbox_capacity(DEFAULT_MAILBOX_CAPACITY)
    }

    pub fn with_mailbox_capacity(mailbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
            mailbox_capacity,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let mailbox = Arc::new(Mailbox::new(self.mailbox_capacity));
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.insert(id, mailbox.clone());
            id
        };
        Subscription {
            id,
            bus: self.clone(),
            mailbox,
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().subscribers.remove(&id);
    }

    /// Publishes to every current subscriber. Never blocks: a full mailbox
    /// drops its oldest entry instead of backing up the publisher.
    pub fn publish(&self, trade: Trade) {
        let subscribers: Vec<Arc<Mailbox>> =
            self.inner.lock().subscribers.values().cloned().collect();
        for mailbox in subscribers {
            mailbox.push(trade.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl Default for TradeBus {
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

    fn test_trade(market_id: &str) -> Trade {
        Trade {
            id: None,
            exchange: Exchange::Kalshi,
            market_id: market_id.to_string(),
            price: dec!(0.5),
            quantity: dec!(1),
            side: Side::Buy,
            timestamp: Utc::now(),
            tx_hash: None,
            dedupe_key: format!("k:{market_id}"),
        }
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let bus = TradeBus::new();
        let sub = bus.subscribe();

        bus.publish(test_trade("a"));
        bus.publish(test_trade("b"));
        bus.publish(test_trade("c"));

        assert_eq!(sub.recv().await.market_id, "a");
        assert_eq!(sub.recv().await.market_id, "b");
        assert_eq!(sub.recv().await.market_id, "c");
    }

    #[tokio::test]
    async fn drops_oldest_on_overflow() {
        let bus = TradeBus::with_mailbox_capacity(2);
        let sub = bus.subscribe();

        bus.publish(test_trade("a"));
        bus.publish(test_trade("b"));
        bus.publish(test_trade("c"));

        assert_eq!(sub.dropped_count(), 1);
        assert_eq!(sub.recv().await.market_id, "b");
        assert_eq!(sub.recv().await.market_id, "c");
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_others() {
        let bus = TradeBus::with_mailbox_capacity(1);
        let slow = bus.subscribe();
        let fast = bus.subscribe();

        bus.publish(test_trade("a"));
        bus.publish(test_trade("b"));

        assert_eq!(fast.recv().await.market_id, "a");
        assert_eq!(fast.recv().await.market_id, "b");
        assert_eq!(slow.recv().await.market_id, "b");
        assert_eq!(slow.dropped_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_publishes_reaching_mailbox() {
        let bus = TradeBus::new();
        let sub = bus.subscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
