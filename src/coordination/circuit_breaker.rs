//! Generic circuit breaker
//!
//! One instance guards one dependency (the upstream connection, the broker API).
//! All transitions happen under a short synchronous lock that is never held across
//! an await, so concurrent callers cannot double-trip the breaker or see a
//! half-applied transition.
//!
//! Cycle: `Closed -> Open -> HalfOpen -> {Closed | Open}`. A failed HalfOpen trial
//! reopens with the cooldown multiplied by `backoff_multiplier`, capped at
//! `max_cooldown`; a successful trial resets the cooldown to its base value.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::clock::{Clock, SharedClock};
use crate::config::BreakerSettings;
use crate::error::CircuitOpenError;

/// Hint returned to callers that arrive while the single HalfOpen trial is running
const HALF_OPEN_RETRY_HINT: Duration = Duration::from_secs(1);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failure threshold exceeded, calls rejected until cooldown elapses
    Open,
    /// One trial call in flight
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name used in logs, metrics and `CircuitOpenError`
    pub name: String,
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Base Open duration
    pub cooldown: Duration,
    /// Cooldown growth after a failed HalfOpen trial
    pub backoff_multiplier: f64,
    pub max_cooldown: Duration,
}

impl CircuitBreakerConfig {
    pub fn from_settings(name: &str, settings: &BreakerSettings) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: Duration::from_secs(settings.cooldown_secs),
            backoff_multiplier: settings.backoff_multiplier.max(1.0),
            max_cooldown: Duration::from_secs(settings.max_cooldown_secs.max(settings.cooldown_secs)),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    cooldown_until: Option<Instant>,
    current_cooldown: Duration,
    trial_in_flight: bool,
    /// Bumped on every state change; outcomes from older permits are ignored
    generation: u64,
}

/// Point-in-time view for health and metrics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_ms: u64,
    pub total_trips: u64,
    pub rejected_calls: u64,
}

/// Error from [`CircuitBreaker::call`]
#[derive(Debug)]
pub enum BreakerCallError<E> {
    /// The breaker refused the call; the function was not invoked
    Open(CircuitOpenError),
    /// The function ran and failed
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerCallError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerCallError::Open(e) => write!(f, "{}", e),
            BreakerCallError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BreakerCallError<E> {}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
    total_trips: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                cooldown_until: None,
                current_cooldown: cooldown,
                trial_in_flight: false,
                generation: 0,
            }),
            total_trips: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Every critical section leaves the state consistent, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let inner = self.lock();
        BreakerSnapshot {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            cooldown_remaining_ms: inner
                .cooldown_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                .unwrap_or(0),
            total_trips: self.total_trips.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    pub fn total_trips(&self) -> u64 {
        self.total_trips.load(Ordering::Relaxed)
    }

    /// Ask permission for one call. The returned permit must be resolved with
    /// [`Permit::success`] or [`Permit::failure`]; dropping it unresolved frees a
    /// HalfOpen trial slot without changing state.
    pub fn try_acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, inner.generation, false)),
            CircuitState::Open => {
                let until = inner.cooldown_until.unwrap_or(now);
                if now >= until {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    inner.generation += 1;
                    debug!(breaker = %self.config.name, "Circuit half-open, allowing one trial call");
                    Ok(Permit::new(self, inner.generation, true))
                } else {
                    drop(inner);
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    Err(self.open_error(until - now))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    drop(inner);
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    Err(self.open_error(HALF_OPEN_RETRY_HINT))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, inner.generation, true))
                }
            }
        }
    }

    fn open_error(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            breaker: self.config.name.clone(),
            retry_after,
        }
    }

    /// Run `f` through the breaker; every error counts as a failure
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(f, |_| true).await
    }

    /// Run `f` through the breaker. Errors for which `is_failure` returns false mean
    /// the dependency answered, and are recorded as successes.
    pub async fn call_with<F, Fut, T, E, P>(
        &self,
        f: F,
        is_failure: P,
    ) -> Result<T, BreakerCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let permit = self.try_acquire().map_err(BreakerCallError::Open)?;

        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                if is_failure(&err) {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(BreakerCallError::Inner(err))
            }
        }
    }

    fn on_success(&self, generation: u64, trial: bool) {
        let mut inner = self.lock();
        if generation != inner.generation {
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.cooldown_until = None;
                inner.current_cooldown = self.config.cooldown;
                inner.trial_in_flight = false;
                inner.generation += 1;
                info!(breaker = %self.config.name, "Circuit closed after successful trial");
            }
            _ => {}
        }
    }

    fn on_failure(&self, generation: u64, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if generation != inner.generation {
            return;
        }
        inner.last_failure_at = Some(self.clock.utc_now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    let cooldown = inner.current_cooldown;
                    inner.state = CircuitState::Open;
                    inner.cooldown_until = Some(now + cooldown);
                    inner.generation += 1;
                    self.total_trips.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        breaker = %self.config.name,
                        failures = inner.failure_count,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                let extended = inner
                    .current_cooldown
                    .mul_f64(self.config.backoff_multiplier)
                    .min(self.config.max_cooldown);
                inner.current_cooldown = extended;
                inner.state = CircuitState::Open;
                inner.cooldown_until = Some(now + extended);
                inner.trial_in_flight = false;
                inner.generation += 1;
                self.total_trips.fetch_add(1, Ordering::Relaxed);
                warn!(
                    breaker = %self.config.name,
                    cooldown_ms = extended.as_millis() as u64,
                    "Trial call failed, circuit reopened"
                );
            }
            _ => {}
        }
    }

    fn on_abandoned(&self, generation: u64) {
        let mut inner = self.lock();
        if generation == inner.generation && inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Permission to make one guarded call
#[must_use = "resolve the permit with success() or failure()"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    resolved: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, trial: bool) -> Self {
        Self {
            breaker,
            generation,
            trial,
            resolved: false,
        }
    }

    /// This permit is the single HalfOpen trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.generation, self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.generation, self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.on_abandoned(self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::clock::ManualClock;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig {
                name: "test".into(),
                failure_threshold: 3,
                cooldown: Duration::from_secs(10),
                backoff_multiplier: 2.0,
                max_cooldown: Duration::from_secs(25),
            },
            clock,
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<(), BreakerCallError<&'static str>> {
        cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("boom")
        })
        .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_invoking() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(clock.clone());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&cb, &calls).await, Err(BreakerCallError::Inner(_))));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        match fail(&cb, &calls).await {
            Err(BreakerCallError::Open(e)) => {
                assert_eq!(e.breaker, "test");
                assert_eq!(e.retry_after, Duration::from_secs(10));
            }
            other => panic!("expected open error, got {:?}", other.err().map(|e| e.to_string())),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.total_trips(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(clock);
        let calls = AtomicU32::new(0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        cb.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_exactly_one_trial_after_cooldown() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(clock.clone());
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }

        clock.advance(Duration::from_secs(9));
        assert!(cb.try_acquire().is_err());

        clock.advance(Duration::from_secs(1));
        let trial = cb.try_acquire().expect("trial permitted");
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_err(), "second concurrent trial must be refused");

        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_failed_trial_extends_cooldown_up_to_cap() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(clock.clone());
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }

        clock.advance(Duration::from_secs(10));
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().cooldown_remaining_ms, 20_000);

        clock.advance(Duration::from_secs(20));
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.snapshot().cooldown_remaining_ms, 25_000);

        clock.advance(Duration::from_secs(25));
        cb.try_acquire().unwrap().success();
        assert_eq!(cb.state(), CircuitState::Closed);

        // Cooldown is back to base after recovery
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }
        assert_eq!(cb.snapshot().cooldown_remaining_ms, 10_000);
    }

    #[tokio::test]
    async fn test_stale_permit_outcome_ignored() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(clock.clone());

        let early = cb.try_acquire().unwrap();
        for _ in 0..3 {
            cb.try_acquire().unwrap().failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Permit issued while Closed cannot close an Open breaker
        early.success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_dropped_trial_frees_slot() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(clock.clone());
        for _ in 0..3 {
            cb.try_acquire().unwrap().failure();
        }
        clock.advance(Duration::from_secs(10));

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_non_failure_errors_do_not_trip() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(clock);

        for _ in 0..5 {
            let res = cb
                .call_with(|| async { Err::<(), _>("rejected") }, |_| false)
                .await;
            assert!(matches!(res, Err(BreakerCallError::Inner("rejected"))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_failures_trip_once() {
        let clock = Arc::new(ManualClock::new());
        let cb = Arc::new(breaker(clock));

        let permits: Vec<_> = (0..10).map(|_| cb.try_acquire().unwrap()).collect();
        for permit in permits {
            permit.failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.total_trips(), 1);
    }
}
