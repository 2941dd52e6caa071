//! Fan-out Distributor
//!
//! Every consumer owns one bounded queue. `publish` never waits: when a queue is
//! full the oldest event is dropped to make room for the newest one. A consumer
//! whose queue overflows more than `max_consecutive_drops` times without reading,
//! or whose receiver was dropped, is evicted and its registry interest released.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use super::registry::{ConsumerId, SubscriptionRegistry};
use crate::cache::QuoteCache;
use crate::config::FanoutConfig;
use crate::coordination::{Clock, SharedClock, ShutdownToken};
use crate::domain::{Heartbeat, Quote, SessionState, StreamEvent};
use crate::services::Metrics;

struct ConsumerQueue {
    events: Mutex<VecDeque<StreamEvent>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    /// Symbols this queue is attached to
    attachments: AtomicUsize,
    /// Overflows since the consumer last read
    consecutive_drops: AtomicU64,
}

impl ConsumerQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            attachments: AtomicUsize::new(0),
            consecutive_drops: AtomicU64::new(0),
        }
    }

    /// Enqueue with drop-oldest. Returns true if an event was dropped.
    fn push(&self, event: StreamEvent) -> bool {
        let dropped = {
            let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
            let dropped = if events.len() >= self.capacity {
                events.pop_front();
                true
            } else {
                false
            };
            events.push_back(event);
            dropped
        };
        if dropped {
            self.consecutive_drops.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<StreamEvent> {
        let event = self
            .events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        if event.is_some() {
            self.consecutive_drops.store(0, Ordering::Relaxed);
        }
        event
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn attach(&self) {
        self.attachments.fetch_add(1, Ordering::SeqCst);
    }

    fn detach(&self) {
        if self.attachments.fetch_sub(1, Ordering::SeqCst) <= 1 {
            self.close();
        }
    }
}

/// Receiving half of a consumer queue
pub struct ConsumerReceiver {
    queue: Arc<ConsumerQueue>,
}

impl ConsumerReceiver {
    /// Next event in publish order. `None` once the consumer was evicted or
    /// unsubscribed from every symbol and the queue is drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.queue.pop()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for ConsumerReceiver {
    fn drop(&mut self) {
        // Lets the next publish evict the consumer
        self.queue.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FanoutDistributor {
    channels: DashMap<String, HashMap<ConsumerId, Arc<ConsumerQueue>>>,
    registry: Arc<SubscriptionRegistry>,
    capacity: usize,
    max_consecutive_drops: u64,
    next_consumer: AtomicU64,
    clock: SharedClock,
    metrics: Arc<Metrics>,
}

impl FanoutDistributor {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        config: &FanoutConfig,
        clock: SharedClock,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            registry,
            capacity: config.channel_capacity,
            max_consecutive_drops: config.max_consecutive_drops,
            next_consumer: AtomicU64::new(1),
            clock,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn next_consumer_id(&self) -> ConsumerId {
        self.next_consumer.fetch_add(1, Ordering::Relaxed)
    }

    /// Attach a new bounded queue for `consumer` on `symbol`
    pub fn subscribe(&self, symbol: &str, consumer: ConsumerId) -> ConsumerReceiver {
        let queue = Arc::new(ConsumerQueue::new(self.capacity));
        self.attach(symbol, consumer, &queue);
        ConsumerReceiver { queue }
    }

    fn attach(&self, symbol: &str, consumer: ConsumerId, queue: &Arc<ConsumerQueue>) {
        queue.attach();
        let replaced = self
            .channels
            .entry(symbol.to_string())
            .or_default()
            .insert(consumer, Arc::clone(queue));
        if let Some(old) = replaced {
            old.detach();
        }
        self.registry.add_subscriber(symbol, consumer);
        debug!(symbol = %symbol, consumer, "Consumer attached");
    }

    /// Detach `consumer` from `symbol`. Returns false if it was not attached.
    pub fn unsubscribe(&self, symbol: &str, consumer: ConsumerId) -> bool {
        let removed = self
            .channels
            .get_mut(symbol)
            .and_then(|mut consumers| consumers.remove(&consumer));
        let Some(queue) = removed else {
            return false;
        };
        self.channels.remove_if(symbol, |_, consumers| consumers.is_empty());
        queue.detach();
        self.registry.remove_subscriber(symbol, consumer);
        debug!(symbol = %symbol, consumer, "Consumer detached");
        true
    }

    fn evict(&self, symbol: &str, consumer: ConsumerId, reason: &str) {
        let removed = self
            .channels
            .get_mut(symbol)
            .and_then(|mut consumers| consumers.remove(&consumer));
        if let Some(queue) = removed {
            self.channels.remove_if(symbol, |_, consumers| consumers.is_empty());
            queue.close();
            queue.detach();
            self.registry.remove_subscriber(symbol, consumer);
            self.metrics.inc_evicted();
            warn!(symbol = %symbol, consumer, reason = %reason, "Evicted consumer");
        }
    }

    /// Push `event` to every consumer of `symbol` without waiting.
    /// Returns the number of consumers that received it.
    fn deliver(&self, symbol: &str, event: StreamEvent) -> usize {
        let mut delivered = 0;
        let mut evictions: Vec<(ConsumerId, &'static str)> = Vec::new();

        if let Some(consumers) = self.channels.get(symbol) {
            for (&consumer, queue) in consumers.iter() {
                if queue.is_closed() {
                    evictions.push((consumer, "receiver closed"));
                    continue;
                }
                if queue.push(event.clone()) {
                    self.metrics.inc_dropped();
                    if queue.consecutive_drops.load(Ordering::Relaxed) > self.max_consecutive_drops {
                        evictions.push((consumer, "too slow"));
                    }
                }
                delivered += 1;
            }
        }

        for (consumer, reason) in evictions {
            self.evict(symbol, consumer, reason);
        }
        delivered
    }

    pub fn publish(&self, symbol: &str, quote: &Quote) -> usize {
        let delivered = self.deliver(symbol, StreamEvent::Quote(quote.clone()));
        for _ in 0..delivered {
            self.metrics.inc_delivered();
        }
        delivered
    }

    /// Emit one heartbeat per symbol that has consumers. Returns symbols covered.
    pub fn heartbeat(&self, upstream: SessionState, cache: &QuoteCache) -> usize {
        let symbols: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        let now = self.clock.utc_now();

        for symbol in &symbols {
            let cached = cache.peek(symbol);
            let heartbeat = Heartbeat {
                symbol: symbol.clone(),
                at: now,
                upstream,
                stale: cached.as_ref().map(|(_, stale)| *stale).unwrap_or(true) || !upstream.is_live(),
                last_quote_at: cached.map(|(q, _)| q.received_at),
            };
            self.deliver(symbol, StreamEvent::Heartbeat(heartbeat));
            self.metrics.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        }
        symbols.len()
    }

    pub async fn run_heartbeats(
        self: Arc<Self>,
        cache: Arc<QuoteCache>,
        state: watch::Receiver<SessionState>,
        every: Duration,
        mut shutdown: ShutdownToken,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let upstream = *state.borrow();
                    self.heartbeat(upstream, &cache);
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Heartbeat task stopped");
    }

    /// One queue for `symbols`, released when the returned guard drops
    pub fn subscribe_many(self: &Arc<Self>, symbols: &[String]) -> StreamSubscription {
        let consumer = self.next_consumer_id();
        let queue = Arc::new(ConsumerQueue::new(self.capacity));
        for symbol in symbols {
            self.attach(symbol, consumer, &queue);
        }
        self.metrics.consumer_added();
        info!(consumer, symbols = ?symbols, "Stream consumer connected");

        StreamSubscription {
            distributor: Arc::clone(self),
            consumer,
            symbols: symbols.to_vec(),
            receiver: ConsumerReceiver { queue },
        }
    }

    pub fn consumer_count(&self, symbol: &str) -> usize {
        self.channels.get(symbol).map(|c| c.len()).unwrap_or(0)
    }
}

/// A consumer's live subscription. Dropping it detaches from every symbol.
pub struct StreamSubscription {
    distributor: Arc<FanoutDistributor>,
    consumer: ConsumerId,
    symbols: Vec<String>,
    receiver: ConsumerReceiver,
}

impl StreamSubscription {
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        for symbol in &self.symbols {
            self.distributor.unsubscribe(symbol, self.consumer);
        }
        self.distributor.metrics.consumer_removed();
        info!(consumer = self.consumer, "Stream consumer disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ManualClock;
    use crate::market_data::registry::test_support::RecordingUpstream;
    use rust_decimal_macros::dec;

    fn setup(capacity: usize, max_drops: u64) -> (Arc<FanoutDistributor>, Arc<RecordingUpstream>, Arc<ManualClock>) {
        let upstream = Arc::new(RecordingUpstream::default());
        let registry = Arc::new(SubscriptionRegistry::new(upstream.clone(), Duration::ZERO));
        let clock = Arc::new(ManualClock::new());
        let config = FanoutConfig {
            channel_capacity: capacity,
            heartbeat_interval_secs: 5,
            max_consecutive_drops: max_drops,
            unsubscribe_grace_ms: 0,
        };
        let fanout = Arc::new(FanoutDistributor::new(
            registry,
            &config,
            clock.clone(),
            Arc::new(Metrics::new()),
        ));
        (fanout, upstream, clock)
    }

    fn quote(symbol: &str, last: rust_decimal::Decimal, clock: &ManualClock) -> Quote {
        let now = clock.utc_now();
        let mut q = Quote::empty(symbol, now, now);
        q.last = Some(last);
        q
    }

    #[tokio::test]
    async fn test_publish_delivers_in_order() {
        let (fanout, upstream, clock) = setup(16, 4);
        let consumer = fanout.next_consumer_id();
        let mut rx = fanout.subscribe("AAPL", consumer);
        assert_eq!(upstream.count("subscribe", "AAPL"), 1);

        for i in 1..=3 {
            assert_eq!(fanout.publish("AAPL", &quote("AAPL", dec!(150) + rust_decimal::Decimal::from(i), &clock)), 1);
        }
        assert_eq!(fanout.publish("MSFT", &quote("MSFT", dec!(300), &clock)), 0);

        for expected in [dec!(151), dec!(152), dec!(153)] {
            match rx.recv().await {
                Some(StreamEvent::Quote(q)) => assert_eq!(q.last, Some(expected)),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let (fanout, _, clock) = setup(2, 100);
        let mut rx = fanout.subscribe("AAPL", 1);

        for last in [dec!(1), dec!(2), dec!(3)] {
            fanout.publish("AAPL", &quote("AAPL", last, &clock));
        }

        let mut seen = Vec::new();
        while let Some(StreamEvent::Quote(q)) = rx.try_recv() {
            seen.push(q.last.unwrap());
        }
        assert_eq!(seen, vec![dec!(2), dec!(3)]);
        assert_eq!(fanout.metrics.events_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted() {
        let (fanout, upstream, clock) = setup(1, 2);
        let mut slow = fanout.subscribe("AAPL", 1);
        let mut fast = fanout.subscribe("AAPL", 2);

        for i in 0..4 {
            fanout.publish("AAPL", &quote("AAPL", rust_decimal::Decimal::from(i), &clock));
            assert!(fast.try_recv().is_some());
        }

        assert_eq!(fanout.consumer_count("AAPL"), 1);
        assert_eq!(fanout.registry().subscriber_count("AAPL"), 1);
        assert_eq!(upstream.count("unsubscribe", "AAPL"), 0);

        // The newest event is still readable, then the stream ends
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_evicted_on_publish() {
        let (fanout, upstream, clock) = setup(8, 4);
        let rx = fanout.subscribe("TSLA", 7);
        drop(rx);

        assert_eq!(fanout.publish("TSLA", &quote("TSLA", dec!(200), &clock)), 0);
        assert_eq!(fanout.consumer_count("TSLA"), 0);
        assert_eq!(upstream.count("unsubscribe", "TSLA"), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_marks_missing_and_stale_quotes() {
        let (fanout, _, clock) = setup(8, 4);
        let cache = QuoteCache::in_memory(1_000, clock.clone(), Arc::new(Metrics::new()));
        cache.set_local("AAPL", quote("AAPL", dec!(150), &clock));

        let mut aapl = fanout.subscribe("AAPL", 1);
        let mut msft = fanout.subscribe("MSFT", 2);

        assert_eq!(fanout.heartbeat(SessionState::Connected, &cache), 2);
        match aapl.try_recv() {
            Some(StreamEvent::Heartbeat(hb)) => assert!(!hb.stale),
            other => panic!("unexpected event {:?}", other),
        }
        match msft.try_recv() {
            Some(StreamEvent::Heartbeat(hb)) => {
                assert!(hb.stale);
                assert!(hb.last_quote_at.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }

        clock.advance(Duration::from_millis(1_001));
        fanout.heartbeat(SessionState::Connected, &cache);
        assert!(matches!(aapl.try_recv(), Some(StreamEvent::Heartbeat(hb)) if hb.stale));

        // Upstream down: stale regardless of quote age
        cache.set_local("AAPL", quote("AAPL", dec!(151), &clock));
        fanout.heartbeat(SessionState::Backoff, &cache);
        assert!(matches!(aapl.try_recv(), Some(StreamEvent::Heartbeat(hb)) if hb.stale));
    }

    #[tokio::test]
    async fn test_subscription_guard_releases_all_symbols() {
        let (fanout, upstream, clock) = setup(8, 4);
        let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        let mut sub = fanout.subscribe_many(&symbols);
        assert_eq!(fanout.metrics.active_consumers.load(Ordering::Relaxed), 1);

        fanout.publish("MSFT", &quote("MSFT", dec!(300), &clock));
        assert!(matches!(sub.recv().await, Some(StreamEvent::Quote(q)) if q.symbol == "MSFT"));

        drop(sub);
        assert_eq!(fanout.consumer_count("AAPL"), 0);
        assert_eq!(fanout.consumer_count("MSFT"), 0);
        assert_eq!(upstream.count("unsubscribe", "AAPL"), 1);
        assert_eq!(upstream.count("unsubscribe", "MSFT"), 1);
        assert_eq!(fanout.metrics.active_consumers.load(Ordering::Relaxed), 0);
    }
}
