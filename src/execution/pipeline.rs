//! Order Execution Pipeline
//!
//! `submit` runs, in order: kill switch, request validation, idempotency claim,
//! then the breaker-guarded broker call with bounded retries. Every outcome is a
//! typed [`OrderResult`]; nothing on this path returns an error to the caller.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::broker::BrokerClient;
use super::idempotency::{Claim, IdempotencyStore};
use crate::config::ExecutionConfig;
use crate::coordination::{
    backoff_delay, BreakerCallError, CircuitBreaker, Clock, KillSwitch, SharedClock,
};
use crate::domain::{OrderErrorKind, OrderRequest, OrderResult};
use crate::error::BrokerError;
use crate::services::Metrics;

/// Whether a result came from this call or was replayed from an earlier one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Fresh,
    Replayed,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_retries: config.max_retries as u32,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            attempt_timeout: Duration::from_millis(config.broker_timeout_ms),
        }
    }
}

pub struct OrderPipeline {
    broker: Arc<dyn BrokerClient>,
    breaker: Arc<CircuitBreaker>,
    kill_switch: Arc<KillSwitch>,
    idempotency: Arc<IdempotencyStore>,
    retry: RetryPolicy,
    clock: SharedClock,
    metrics: Arc<Metrics>,
}

impl OrderPipeline {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        breaker: Arc<CircuitBreaker>,
        kill_switch: Arc<KillSwitch>,
        idempotency: Arc<IdempotencyStore>,
        retry: RetryPolicy,
        clock: SharedClock,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            broker,
            breaker,
            kill_switch,
            idempotency,
            retry,
            clock,
            metrics,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyStore> {
        &self.idempotency
    }

    pub async fn submit(&self, req: OrderRequest) -> OrderResult {
        self.submit_tracked(req).await.0
    }

    pub async fn submit_tracked(&self, req: OrderRequest) -> (OrderResult, Disposition) {
        self.metrics.orders_received.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.kill_switch.check() {
            return self.finish_rejected(&req, OrderErrorKind::KillSwitchEngaged, e.to_string());
        }
        if let Err(msg) = req.validate() {
            return self.finish_rejected(&req, OrderErrorKind::ValidationError, msg);
        }

        match self.idempotency.begin(&req).await {
            Claim::Fresh => {}
            Claim::Replay(result) => {
                info!(
                    key = %req.idempotency_key,
                    status = ?result.status,
                    "Duplicate order, returning recorded result"
                );
                self.metrics.record_order(result.error_kind(), true);
                return (result, Disposition::Replayed);
            }
            Claim::Unavailable(msg) => {
                return self.finish_rejected(&req, OrderErrorKind::Unavailable, msg);
            }
        }

        let result = self.execute(&req).await;

        // Once the broker has seen the order the key must stay claimed
        let release = result.attempt_count == 0
            && result.error_kind().map(|k| k.releases_key()).unwrap_or(false);
        if release {
            self.idempotency.release(&req.idempotency_key).await;
        } else {
            self.idempotency.complete(&req, &result).await;
        }
        self.metrics.record_order(result.error_kind(), false);

        match &result.error {
            None => info!(
                key = %req.idempotency_key,
                order_id = ?result.order_id,
                status = ?result.status,
                attempts = result.attempt_count,
                "Order completed"
            ),
            Some(failure) => warn!(
                key = %req.idempotency_key,
                kind = ?failure.kind,
                attempts = result.attempt_count,
                "Order failed: {}",
                failure.message
            ),
        }
        (result, Disposition::Fresh)
    }

    /// Outcome decided before the key was claimed; nothing to store or release
    fn finish_rejected(
        &self,
        req: &OrderRequest,
        kind: OrderErrorKind,
        message: String,
    ) -> (OrderResult, Disposition) {
        warn!(key = %req.idempotency_key, kind = ?kind, "Order refused: {}", message);
        let result = OrderResult::failure(req, kind, message, 0, self.clock.utc_now());
        self.metrics.record_order(Some(kind), false);
        (result, Disposition::Fresh)
    }

    async fn execute(&self, req: &OrderRequest) -> OrderResult {
        let mut attempts: u32 = 0;

        loop {
            if attempts > 0 {
                if let Err(e) = self.kill_switch.check() {
                    return self.stopped(req, attempts, e.to_string());
                }
            }

            let outcome = self
                .breaker
                .call_with(|| self.call_broker(req), BrokerError::trips_breaker)
                .await;

            match outcome {
                Ok(ack) => {
                    attempts += 1;
                    return ack.into_result(req, attempts, self.clock.utc_now());
                }
                Err(BreakerCallError::Open(open)) if attempts > 0 => {
                    return self.stopped(req, attempts, open.to_string());
                }
                // Refused before reaching the broker: no attempt consumed
                Err(BreakerCallError::Open(open)) => {
                    return OrderResult::failure(
                        req,
                        OrderErrorKind::CircuitOpen,
                        open.to_string(),
                        attempts,
                        self.clock.utc_now(),
                    );
                }
                Err(BreakerCallError::Inner(BrokerError::Rejected(reason))) => {
                    attempts += 1;
                    return OrderResult::failure(
                        req,
                        OrderErrorKind::ValidationError,
                        reason,
                        attempts,
                        self.clock.utc_now(),
                    );
                }
                Err(BreakerCallError::Inner(err)) => {
                    attempts += 1;
                    if attempts > self.retry.max_retries {
                        return OrderResult::failure(
                            req,
                            OrderErrorKind::Failed,
                            format!("gave up after {} attempts: {}", attempts, err),
                            attempts,
                            self.clock.utc_now(),
                        );
                    }

                    let delay = match &err {
                        BrokerError::RateLimited {
                            retry_after_ms: Some(ms),
                        } => Duration::from_millis(*ms).min(self.retry.max_delay),
                        _ => backoff_delay(self.retry.base_delay, self.retry.max_delay, attempts),
                    };
                    self.metrics.broker_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        key = %req.idempotency_key,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient broker error, retrying: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Retry loop cut short after the broker was reached. Terminal, since an
    /// earlier attempt may have been accepted upstream.
    fn stopped(&self, req: &OrderRequest, attempts: u32, reason: String) -> OrderResult {
        OrderResult::failure(
            req,
            OrderErrorKind::Failed,
            format!("stopped after {} attempt(s): {}", attempts, reason),
            attempts,
            self.clock.utc_now(),
        )
    }

    async fn call_broker(&self, req: &OrderRequest) -> Result<crate::domain::BrokerAck, BrokerError> {
        self.metrics.broker_calls.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.retry.attempt_timeout, self.broker.submit_order(req)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout {
                elapsed_ms: self.retry.attempt_timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CircuitBreakerConfig, CircuitState, ManualClock};
    use crate::config::{AppConfig, IdempotencyFailureMode};
    use crate::domain::{BrokerAck, OrderSide, OrderStatus};
    use crate::execution::broker::MockBrokerClient;
    use std::sync::atomic::AtomicU32;

    fn ack(id: &str) -> BrokerAck {
        BrokerAck {
            broker_order_id: id.to_string(),
            status: OrderStatus::Filled,
            filled_qty: 10,
            avg_fill_price: None,
        }
    }

    fn pipeline(broker: MockBrokerClient, threshold: u32) -> (OrderPipeline, Arc<KillSwitch>) {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let kill_switch = Arc::new(KillSwitch::new(clock.clone()));
        let pipeline = pipeline_with(broker, threshold, clock, kill_switch.clone());
        (pipeline, kill_switch)
    }

    fn pipeline_with(
        broker: MockBrokerClient,
        threshold: u32,
        clock: SharedClock,
        kill_switch: Arc<KillSwitch>,
    ) -> OrderPipeline {
        let metrics = Arc::new(Metrics::new());
        let mut config = AppConfig::paper_defaults("http://localhost", "ws://localhost").execution;
        config.max_retries = 2;
        config.retry_base_delay_ms = 1;
        config.retry_max_delay_ms = 4;
        config.idempotency_failure_mode = IdempotencyFailureMode::FailClosed;

        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig {
                name: "broker".into(),
                failure_threshold: threshold,
                cooldown: Duration::from_secs(30),
                backoff_multiplier: 2.0,
                max_cooldown: Duration::from_secs(300),
            },
            clock.clone(),
        ));
        let idempotency = Arc::new(IdempotencyStore::new(
            &config,
            None,
            Duration::from_millis(100),
            clock.clone(),
            metrics.clone(),
        ));
        OrderPipeline::new(
            Arc::new(broker),
            breaker,
            kill_switch,
            idempotency,
            RetryPolicy::from_config(&config),
            clock,
            metrics,
        )
    }

    fn order(key: &str) -> OrderRequest {
        OrderRequest::market("AAPL", OrderSide::Buy, 10, key)
    }

    #[tokio::test]
    async fn test_duplicate_returns_identical_result() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_submit_order()
            .times(1)
            .returning(|_| Ok(ack("ord-1")));
        let (pipeline, _) = pipeline(broker, 5);

        let (first, d1) = pipeline.submit_tracked(order("abc123")).await;
        let (second, d2) = pipeline.submit_tracked(order("abc123")).await;

        assert_eq!(first, second);
        assert_eq!(first.order_id.as_deref(), Some("ord-1"));
        assert_eq!(d1, Disposition::Fresh);
        assert_eq!(d2, Disposition::Replayed);
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_before_broker() {
        let mut broker = MockBrokerClient::new();
        broker.expect_submit_order().never();
        let (pipeline, kill_switch) = pipeline(broker, 5);
        kill_switch.engage("manual halt", "ops");

        for i in 0..10 {
            let result = pipeline.submit(order(&format!("k{}", i))).await;
            assert_eq!(result.error_kind(), Some(OrderErrorKind::KillSwitchEngaged));
            assert_eq!(result.status, OrderStatus::Rejected);
            assert!(result.error.unwrap().message.contains("manual halt"));
        }
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);

        // Blocked keys were never claimed
        kill_switch.release("ops");
        assert!(pipeline.idempotency().is_empty());
    }

    #[tokio::test]
    async fn test_validation_errors_never_reach_broker() {
        let mut broker = MockBrokerClient::new();
        broker.expect_submit_order().never();
        let (pipeline, _) = pipeline(broker, 5);

        let mut req = order("k");
        req.qty = 0;
        let result = pipeline.submit(req).await;
        assert_eq!(result.error_kind(), Some(OrderErrorKind::ValidationError));
        assert_eq!(result.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut broker = MockBrokerClient::new();
        let counter = calls.clone();
        broker.expect_submit_order().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BrokerError::Server {
                    status: 503,
                    message: "unavailable".into(),
                })
            } else {
                Ok(ack("ord-3"))
            }
        });
        let (pipeline, _) = pipeline(broker, 5);

        let result = pipeline.submit(order("k")).await;
        assert!(result.is_success());
        assert_eq!(result.attempt_count, 3);
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_not_retried() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_submit_order()
            .times(1)
            .returning(|_| Err(BrokerError::Rejected("insufficient buying power".into())));
        let (pipeline, _) = pipeline(broker, 1);

        let result = pipeline.submit(order("k")).await;
        assert_eq!(result.error_kind(), Some(OrderErrorKind::ValidationError));
        assert_eq!(result.attempt_count, 1);
        // A rejection means the broker answered
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);

        // Terminal: the duplicate replays the rejection without a second call
        let again = pipeline.submit(order("k")).await;
        assert_eq!(again, result);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_and_releases_key() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_submit_order()
            .times(2)
            .returning(|_| Err(BrokerError::Timeout { elapsed_ms: 10 }));
        let (pipeline, _) = pipeline(broker, 2);

        // Two failed attempts trip the breaker; the third attempt is refused
        let first = pipeline.submit(order("k1")).await;
        assert_eq!(first.error_kind(), Some(OrderErrorKind::Failed));
        assert_eq!(first.attempt_count, 2);
        assert!(first.error.as_ref().unwrap().message.contains("is open"));
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);
        assert_eq!(pipeline.idempotency().len(), 1);

        // Never reached the broker: the key is handed back
        let second = pipeline.submit(order("k2")).await;
        assert_eq!(second.error_kind(), Some(OrderErrorKind::CircuitOpen));
        assert_eq!(second.attempt_count, 0);
        assert_eq!(pipeline.idempotency().len(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opening_mid_retry_keeps_the_key() {
        let clock = Arc::new(ManualClock::new());
        let shared: SharedClock = clock.clone();
        let mut broker = MockBrokerClient::new();
        broker
            .expect_submit_order()
            .times(1)
            .returning(|_| Err(BrokerError::Timeout { elapsed_ms: 10 }));
        let kill_switch = Arc::new(KillSwitch::new(shared.clone()));
        let pipeline = pipeline_with(broker, 1, shared, kill_switch);

        let first = pipeline.submit(order("k1")).await;
        assert_eq!(first.error_kind(), Some(OrderErrorKind::Failed));
        assert_eq!(first.status, OrderStatus::Failed);
        assert_eq!(first.attempt_count, 1);

        // After the cooldown the breaker would allow a trial, but the order may
        // already be live upstream; the same key replays the stored outcome
        clock.advance(Duration::from_secs(31));
        assert_eq!(pipeline.breaker().snapshot().cooldown_remaining_ms, 0);
        let (again, disposition) = pipeline.submit_tracked(order("k1")).await;
        assert_eq!(disposition, Disposition::Replayed);
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn test_kill_switch_engaged_mid_retry_keeps_the_key() {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let kill_switch = Arc::new(KillSwitch::new(clock.clone()));
        let halt = kill_switch.clone();
        let mut broker = MockBrokerClient::new();
        broker.expect_submit_order().times(1).returning(move |_| {
            halt.engage("risk limit", "ops");
            Err(BrokerError::Server {
                status: 503,
                message: "unavailable".into(),
            })
        });
        let pipeline = pipeline_with(broker, 5, clock, kill_switch.clone());

        let first = pipeline.submit(order("k1")).await;
        assert_eq!(first.error_kind(), Some(OrderErrorKind::Failed));
        assert_eq!(first.attempt_count, 1);
        assert!(first.error.as_ref().unwrap().message.contains("risk limit"));

        kill_switch.release("ops");
        let (again, disposition) = pipeline.submit_tracked(order("k1")).await;
        assert_eq!(disposition, Disposition::Replayed);
        assert_eq!(again, first);
    }
}
