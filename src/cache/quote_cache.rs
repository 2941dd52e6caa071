//! Latest-quote store
//!
//! The in-process map is always written first and is the read path for this
//! process. An optional external backend receives write-through copies and
//! seeds the map on warm-up. When the backend stops answering, the cache keeps
//! serving from the map and raises the degraded signal (log + metric) until a
//! probe succeeds again.
//!
//! The ingest path never waits on the backend: [`QuoteCache::persist_in_background`]
//! hands the write to a per-symbol writer task that coalesces to the newest quote.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::CacheBackend;
use crate::coordination::{Clock, SharedClock, ShutdownToken};
use crate::domain::Quote;
use crate::error::CacheError;
use crate::services::Metrics;

/// How long the backend keeps a quote row; staleness is judged from `received_at`
const BACKEND_ENTRY_TTL: Duration = Duration::from_secs(3600);

fn backend_key(symbol: &str) -> String {
    format!("quote:{}", symbol)
}

pub struct QuoteCache {
    quotes: DashMap<String, Quote>,
    /// Symbols with a writer task running; `Some` is the next quote it will write
    pending_writes: DashMap<String, Option<Quote>>,
    backend: Option<Arc<dyn CacheBackend>>,
    ttl_ms: u64,
    backend_timeout: Duration,
    degraded: AtomicBool,
    clock: SharedClock,
    metrics: Arc<Metrics>,
}

impl QuoteCache {
    /// In-process cache with no external backend
    pub fn in_memory(ttl_ms: u64, clock: SharedClock, metrics: Arc<Metrics>) -> Self {
        Self::new(None, ttl_ms, Duration::from_millis(250), clock, metrics)
    }

    pub fn new(
        backend: Option<Arc<dyn CacheBackend>>,
        ttl_ms: u64,
        backend_timeout: Duration,
        clock: SharedClock,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            quotes: DashMap::new(),
            pending_writes: DashMap::new(),
            backend,
            ttl_ms,
            backend_timeout,
            degraded: AtomicBool::new(false),
            clock,
            metrics,
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map(|b| b.name()).unwrap_or("none")
    }

    /// Store a quote locally and write it through to the backend
    pub async fn set(&self, symbol: &str, quote: Quote) {
        self.set_local(symbol, quote.clone());
        self.persist(symbol, &quote).await;
    }

    /// Local write only; last write wins per symbol
    pub fn set_local(&self, symbol: &str, quote: Quote) {
        self.quotes.insert(symbol.to_string(), quote);
    }

    /// Write-through to the backend. Skipped while degraded.
    pub async fn persist(&self, symbol: &str, quote: &Quote) {
        let Some(backend) = self.usable_backend() else {
            return;
        };
        let value = match serde_json::to_value(quote) {
            Ok(v) => v,
            Err(e) => {
                warn!(symbol = %symbol, "Failed to encode quote for cache backend: {}", e);
                return;
            }
        };

        let result = self
            .with_timeout(backend.set(&backend_key(symbol), value, BACKEND_ENTRY_TTL))
            .await;
        if let Err(e) = result {
            self.enter_degraded(&e);
        }
    }

    /// Queue a write-through without waiting for it. At most one write per
    /// symbol is in flight; quotes arriving meanwhile replace each other.
    pub fn persist_in_background(self: &Arc<Self>, symbol: &str, quote: Quote) {
        if self.usable_backend().is_none() {
            return;
        }
        match self.pending_writes.entry(symbol.to_string()) {
            Entry::Occupied(mut queued) => {
                queued.insert(Some(quote));
                return;
            }
            Entry::Vacant(idle) => {
                idle.insert(None);
            }
        }

        let cache = Arc::clone(self);
        let symbol = symbol.to_string();
        tokio::spawn(async move {
            cache.drain_writes(symbol, quote).await;
        });
    }

    async fn drain_writes(&self, symbol: String, mut quote: Quote) {
        loop {
            self.persist(&symbol, &quote).await;

            let next = match self.pending_writes.entry(symbol.clone()) {
                Entry::Occupied(mut queued) => match queued.get_mut().take() {
                    Some(next) => next,
                    None => {
                        queued.remove();
                        return;
                    }
                },
                Entry::Vacant(_) => return,
            };
            quote = next;
        }
    }

    /// Latest quote for `symbol` and whether it is stale
    pub async fn get(&self, symbol: &str) -> Option<(Quote, bool)> {
        if let Some(hit) = self.peek(symbol) {
            return Some(hit);
        }

        let quote = self.load_from_backend(symbol).await?;
        self.quotes
            .entry(symbol.to_string())
            .or_insert_with(|| quote.clone());
        let stale = quote.is_stale(self.clock.utc_now(), self.ttl_ms);
        Some((quote, stale))
    }

    /// Local-only lookup, never touches the backend
    pub fn peek(&self, symbol: &str) -> Option<(Quote, bool)> {
        let now = self.clock.utc_now();
        self.quotes.get(symbol).map(|q| {
            let stale = q.is_stale(now, self.ttl_ms);
            (q.clone(), stale)
        })
    }

    /// Seed the local map from the backend. Returns how many symbols were loaded.
    pub async fn warm(&self, symbols: &[String]) -> usize {
        if self.usable_backend().is_none() {
            return 0;
        }

        let mut loaded = 0;
        for symbol in symbols {
            let Some(quote) = self.load_from_backend(symbol).await else {
                if self.is_degraded() {
                    break;
                }
                continue;
            };

            // Never overwrite a newer live quote with a backend copy
            let mut inserted = false;
            self.quotes
                .entry(symbol.clone())
                .and_modify(|existing| {
                    if quote.received_at > existing.received_at {
                        *existing = quote.clone();
                        inserted = true;
                    }
                })
                .or_insert_with(|| {
                    inserted = true;
                    quote.clone()
                });
            if inserted {
                loaded += 1;
            }
        }

        debug!(requested = symbols.len(), loaded, "Quote cache warmed");
        loaded
    }

    pub fn symbols(&self) -> Vec<String> {
        self.quotes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// Check the backend and leave degraded mode if it answers. Returns true when healthy.
    pub async fn probe_backend(&self) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return true;
        };

        match self.with_timeout(backend.ping()).await {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    self.metrics.set_cache_degraded(false);
                    info!(
                        backend = backend.name(),
                        "Quote cache backend reachable again, leaving degraded mode"
                    );
                    self.resync().await;
                }
                true
            }
            Err(e) => {
                self.enter_degraded(&e);
                false
            }
        }
    }

    /// Periodic probe until shutdown
    pub async fn run_probe_loop(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownToken) {
        if self.backend.is_none() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_degraded() {
                        self.probe_backend().await;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Push the local map to the backend after recovery
    async fn resync(&self) {
        let snapshot: Vec<(String, Quote)> = self
            .quotes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (symbol, quote) in snapshot {
            self.persist(&symbol, &quote).await;
            if self.is_degraded() {
                break;
            }
        }
    }

    fn usable_backend(&self) -> Option<&Arc<dyn CacheBackend>> {
        if self.is_degraded() {
            return None;
        }
        self.backend.as_ref()
    }

    async fn load_from_backend(&self, symbol: &str) -> Option<Quote> {
        let backend = self.usable_backend()?;
        match self.with_timeout(backend.get(&backend_key(symbol))).await {
            Ok(Some(value)) => match serde_json::from_value::<Quote>(value) {
                Ok(q) => Some(q),
                Err(e) => {
                    warn!(symbol = %symbol, "Discarding undecodable cached quote: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.enter_degraded(&e);
                None
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.backend_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.backend_timeout.as_millis() as u64)),
        }
    }

    fn enter_degraded(&self, error: &CacheError) {
        self.metrics
            .cache_backend_errors
            .fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::SeqCst) {
            self.metrics.set_cache_degraded(true);
            warn!(
                backend = self.backend_name(),
                error = %error,
                "Quote cache backend unreachable, DEGRADED to in-process map"
            );
        }
    }
}
