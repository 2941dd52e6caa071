//! Reference-counted symbol interest
//!
//! Upstream subscribe is issued on a symbol's 0→1 transition and unsubscribe on
//! 1→0, optionally after a grace window. Re-subscribing inside the window cancels
//! the pending unsubscribe, so upstream never sees the gap. Upstream calls are made
//! while the symbol's entry is locked, keeping subscribe/unsubscribe for one symbol
//! in transition order.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Downstream consumer handle
pub type ConsumerId = u64;

/// Receiver of upstream subscription changes. Implementations must not block.
pub trait UpstreamControl: Send + Sync {
    fn subscribe(&self, symbol: &str);
    fn unsubscribe(&self, symbol: &str);
}

#[derive(Debug, Default)]
struct SymbolEntry {
    consumers: HashSet<ConsumerId>,
    upstream_subscribed: bool,
    /// Generation of the scheduled unsubscribe, if one is pending
    pending_unsubscribe: Option<u64>,
}

impl SymbolEntry {
    fn is_idle(&self) -> bool {
        self.consumers.is_empty() && !self.upstream_subscribed && self.pending_unsubscribe.is_none()
    }
}

pub struct SubscriptionRegistry {
    entries: DashMap<String, SymbolEntry>,
    upstream: Arc<dyn UpstreamControl>,
    grace: Duration,
    generation: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(upstream: Arc<dyn UpstreamControl>, grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            upstream,
            grace,
            generation: AtomicU64::new(0),
        }
    }

    /// Register interest. Returns false if the consumer was already subscribed.
    pub fn add_subscriber(&self, symbol: &str, consumer: ConsumerId) -> bool {
        let mut entry = self.entries.entry(symbol.to_string()).or_default();
        let was_empty = entry.consumers.is_empty();
        if !entry.consumers.insert(consumer) {
            return false;
        }

        if was_empty {
            if entry.pending_unsubscribe.take().is_some() {
                debug!(symbol = %symbol, "Resubscribed within grace window, pending unsubscribe cancelled");
            } else if !entry.upstream_subscribed {
                entry.upstream_subscribed = true;
                self.upstream.subscribe(symbol);
            }
        }
        true
    }

    /// Drop interest. Returns false if the consumer was not subscribed.
    pub fn remove_subscriber(self: &Arc<Self>, symbol: &str, consumer: ConsumerId) -> bool {
        let Some(mut entry) = self.entries.get_mut(symbol) else {
            return false;
        };
        if !entry.consumers.remove(&consumer) {
            return false;
        }
        if !entry.consumers.is_empty() || !entry.upstream_subscribed {
            return true;
        }

        let handle = tokio::runtime::Handle::try_current();
        match handle {
            Ok(handle) if !self.grace.is_zero() => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                entry.pending_unsubscribe = Some(generation);
                drop(entry);

                let registry: Weak<Self> = Arc::downgrade(self);
                let symbol = symbol.to_string();
                let grace = self.grace;
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.finish_unsubscribe(&symbol, generation);
                    }
                });
            }
            _ => {
                entry.upstream_subscribed = false;
                self.upstream.unsubscribe(symbol);
                drop(entry);
                self.entries.remove_if(symbol, |_, e| e.is_idle());
            }
        }
        true
    }

    fn finish_unsubscribe(&self, symbol: &str, generation: u64) {
        if let Some(mut entry) = self.entries.get_mut(symbol) {
            if entry.pending_unsubscribe != Some(generation) || !entry.consumers.is_empty() {
                return;
            }
            entry.pending_unsubscribe = None;
            entry.upstream_subscribed = false;
            self.upstream.unsubscribe(symbol);
        }
        self.entries.remove_if(symbol, |_, e| e.is_idle());
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.entries
            .get(symbol)
            .map(|e| e.consumers.len())
            .unwrap_or(0)
    }

    /// Symbols with at least one consumer
    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.consumers.is_empty())
            .map(|e| e.key().clone())
            .collect();
        symbols.sort();
        symbols
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingUpstream;
    use super::*;

    fn registry(grace_ms: u64) -> (Arc<SubscriptionRegistry>, Arc<RecordingUpstream>) {
        let upstream = Arc::new(RecordingUpstream::default());
        let registry = Arc::new(SubscriptionRegistry::new(
            upstream.clone(),
            Duration::from_millis(grace_ms),
        ));
        (registry, upstream)
    }

    #[tokio::test]
    async fn test_subscribe_once_per_zero_to_one() {
        let (reg, upstream) = registry(0);

        assert!(reg.add_subscriber("AAPL", 1));
        assert!(reg.add_subscriber("AAPL", 2));
        assert!(!reg.add_subscriber("AAPL", 2));
        assert_eq!(reg.subscriber_count("AAPL"), 2);
        assert_eq!(upstream.count("subscribe", "AAPL"), 1);

        assert!(reg.remove_subscriber("AAPL", 1));
        assert_eq!(upstream.count("unsubscribe", "AAPL"), 0);
        assert!(reg.remove_subscriber("AAPL", 2));
        assert!(!reg.remove_subscriber("AAPL", 2));
        assert_eq!(upstream.count("unsubscribe", "AAPL"), 1);
        assert!(reg.active_symbols().is_empty());

        reg.add_subscriber("AAPL", 3);
        assert_eq!(
            upstream.calls(),
            vec![
                ("subscribe".to_string(), "AAPL".to_string()),
                ("unsubscribe".to_string(), "AAPL".to_string()),
                ("subscribe".to_string(), "AAPL".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window_debounces_unsubscribe() {
        let (reg, upstream) = registry(2_000);

        reg.add_subscriber("AAPL", 1);
        reg.remove_subscriber("AAPL", 1);
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Rapid reconnect inside the window: no unsubscribe, no second subscribe
        reg.add_subscriber("AAPL", 2);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(upstream.count("subscribe", "AAPL"), 1);
        assert_eq!(upstream.count("unsubscribe", "AAPL"), 0);

        reg.remove_subscriber("AAPL", 2);
        tokio::time::sleep(Duration::from_millis(1_999)).await;
        assert_eq!(upstream.count("unsubscribe", "AAPL"), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(upstream.count("unsubscribe", "AAPL"), 1);
        assert_eq!(reg.subscriber_count("AAPL"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_grace_timer_ignored() {
        let (reg, upstream) = registry(1_000);

        reg.add_subscriber("MSFT", 1);
        reg.remove_subscriber("MSFT", 1); // timer A
        tokio::time::sleep(Duration::from_millis(600)).await;
        reg.add_subscriber("MSFT", 2);
        reg.remove_subscriber("MSFT", 2); // timer B supersedes A
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Timer A fired but is stale
        assert_eq!(upstream.count("unsubscribe", "MSFT"), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(upstream.count("unsubscribe", "MSFT"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_adds_subscribe_once() {
        let (reg, upstream) = registry(0);
        let mut handles = Vec::new();
        for id in 0..32u64 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.add_subscriber("TSLA", id);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(reg.subscriber_count("TSLA"), 32);
        assert_eq!(upstream.count("subscribe", "TSLA"), 1);
    }
}
