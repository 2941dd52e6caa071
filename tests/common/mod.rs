//! Scripted upstream provider shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use quoteflow::cache::{CacheBackend, InMemoryBackend};
use quoteflow::coordination::SystemClock;
use quoteflow::domain::{Session, SessionGrant};
use quoteflow::error::{CacheError, QuoteflowError, Result};
use quoteflow::market_data::{ControlFrame, MarketDataProvider, UpstreamStream};

/// Provider whose behavior the test drives: fail or accept session creation,
/// push raw frames into the current stream, drop the stream.
pub struct MockProvider {
    fail_connects: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
    sent: Arc<Mutex<Vec<ControlFrame>>>,
    feed: Mutex<Option<mpsc::UnboundedSender<String>>>,
    session_lifetime: chrono::Duration,
    open_streams: Arc<AtomicUsize>,
    max_open_streams: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Self::with_session_lifetime(chrono::Duration::hours(1))
    }

    /// Sessions (created and refreshed) expire this long after issue
    pub fn with_session_lifetime(lifetime: chrono::Duration) -> Arc<Self> {
        Arc::new(Self {
            fail_connects: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            feed: Mutex::new(None),
            session_lifetime: lifetime,
            open_streams: Arc::new(AtomicUsize::new(0)),
            max_open_streams: AtomicUsize::new(0),
        })
    }

    /// Most streams that were ever open at the same time
    pub fn max_open_streams(&self) -> usize {
        self.max_open_streams.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_connects.store(failing, Ordering::SeqCst);
    }

    /// Instants of every `create_session` call
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<ControlFrame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.feed.lock().unwrap().is_some()
    }

    /// Deliver one raw text message on the open stream
    pub fn push(&self, text: &str) {
        let feed = self.feed.lock().unwrap();
        feed.as_ref()
            .expect("no open stream")
            .send(text.to_string())
            .expect("stream reader gone");
    }

    /// Close the current stream from the server side
    pub fn drop_stream(&self) {
        self.feed.lock().unwrap().take();
    }
}

#[async_trait]
impl MarketDataProvider for MockProvider {
    async fn create_session(&self) -> Result<SessionGrant> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(Instant::now());
            attempts.len()
        };
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(QuoteflowError::TransientUpstream("connection refused".into()));
        }
        Ok(SessionGrant {
            token: format!("test-token-{}", attempt),
            expires_at: Utc::now() + self.session_lifetime,
        })
    }

    async fn refresh_session(&self, _session: &Session) -> Result<SessionGrant> {
        Ok(SessionGrant {
            token: "test-token-renewed".into(),
            expires_at: Utc::now() + self.session_lifetime,
        })
    }

    async fn open_stream(&self, _session: &Session) -> Result<Box<dyn UpstreamStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().unwrap() = Some(tx);
        let open = self.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_streams.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(MockStream {
            rx,
            sent: self.sent.clone(),
            open_streams: self.open_streams.clone(),
        }))
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<ControlFrame>>>,
    open_streams: Arc<AtomicUsize>,
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpstreamStream for MockStream {
    async fn send(&mut self, frame: &ControlFrame) -> Result<()> {
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// In-memory backend whose writes take `write_delay`
pub struct SlowBackend {
    inner: InMemoryBackend,
    write_delay: Duration,
    writes: AtomicUsize,
}

impl SlowBackend {
    pub fn new(write_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryBackend::new(SystemClock::shared()),
            write_delay,
            writes: AtomicUsize::new(0),
        })
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn get(&self, key: &str) -> std::result::Result<Option<Value>, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> std::result::Result<(), CacheError> {
        tokio::time::sleep(self.write_delay).await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> std::result::Result<bool, CacheError> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), CacheError> {
        self.inner.delete(key).await
    }
}

/// Let spawned tasks run until they block again
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Broker that fills everything after a short delay and counts calls
pub struct CountingBroker {
    calls: std::sync::atomic::AtomicUsize,
    delay: std::time::Duration,
}

impl CountingBroker {
    pub fn new(delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: std::sync::atomic::AtomicUsize::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl quoteflow::execution::BrokerClient for CountingBroker {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn submit_order(
        &self,
        req: &quoteflow::domain::OrderRequest,
    ) -> std::result::Result<quoteflow::domain::BrokerAck, quoteflow::error::BrokerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        Ok(quoteflow::domain::BrokerAck {
            broker_order_id: format!("broker-{}", n),
            status: quoteflow::domain::OrderStatus::Filled,
            filled_qty: req.qty,
            avg_fill_price: Some(rust_decimal_macros::dec!(190.05)),
        })
    }
}
