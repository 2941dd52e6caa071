//! Idempotency Store
//!
//! Per-key check-and-set in front of the broker. The first request for a key
//! claims it; concurrent duplicates wait for that request's result instead of
//! reaching the broker. Terminal results are kept for the configured TTL.
//!
//! With a persistent backend the claim is also written there with
//! `set_if_absent`, so duplicates arriving at other processes are caught. When
//! that backend is unreachable the configured [`IdempotencyFailureMode`] decides
//! whether new orders are refused or accepted with duplicate risk.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::CacheBackend;
use crate::config::{ExecutionConfig, IdempotencyFailureMode};
use crate::coordination::{Clock, SharedClock};
use crate::domain::{OrderRequest, OrderResult};
use crate::services::Metrics;

/// Outcome of claiming an idempotency key
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Key claimed; the caller must finish with `complete` or `release`
    Fresh,
    /// Key already used; return this result unchanged
    Replay(OrderResult),
    /// Persistent backend down under fail-closed policy
    Unavailable(String),
}

enum Slot {
    InFlight {
        done: watch::Sender<Option<OrderResult>>,
        fingerprint: String,
    },
    Completed {
        result: OrderResult,
        fingerprint: String,
        expires_at: Instant,
    },
}

/// Backend record, one per key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    fingerprint: String,
    #[serde(default)]
    result: Option<OrderResult>,
}

enum Step {
    Claimed,
    Replay(OrderResult, String),
    Wait(watch::Receiver<Option<OrderResult>>, String),
}

pub struct IdempotencyStore {
    slots: DashMap<String, Slot>,
    backend: Option<Arc<dyn CacheBackend>>,
    ttl: Duration,
    failure_mode: IdempotencyFailureMode,
    duplicate_wait: Duration,
    backend_timeout: Duration,
    clock: SharedClock,
    metrics: Arc<Metrics>,
}

fn backend_key(key: &str) -> String {
    format!("idem:{}", key)
}

impl IdempotencyStore {
    pub fn new(
        config: &ExecutionConfig,
        backend: Option<Arc<dyn CacheBackend>>,
        backend_timeout: Duration,
        clock: SharedClock,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            backend,
            ttl: Duration::from_secs(config.idempotency_ttl_secs),
            failure_mode: config.idempotency_failure_mode,
            duplicate_wait: Duration::from_millis(config.duplicate_wait_ms),
            backend_timeout,
            clock,
            metrics,
        }
    }

    pub fn failure_mode(&self) -> IdempotencyFailureMode {
        self.failure_mode
    }

    /// Keys currently tracked in process (in flight or completed)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Atomically claim `req.idempotency_key`, or return the result recorded for it
    pub async fn begin(&self, req: &OrderRequest) -> Claim {
        let fingerprint = req.fingerprint();

        loop {
            match self.claim_local(&req.idempotency_key, &fingerprint) {
                Step::Claimed => return self.claim_backend(req, &fingerprint).await,
                Step::Replay(result, prior) => return self.replay(req, &fingerprint, &prior, result),
                Step::Wait(mut rx, prior) => {
                    debug!(key = %req.idempotency_key, "Duplicate in flight, waiting for its result");
                    let waited = tokio::time::timeout(self.duplicate_wait, rx.wait_for(|r| r.is_some()))
                        .await
                        .map(|done| done.map(|result| result.clone()));
                    match waited {
                        Ok(Ok(Some(result))) => {
                            return self.replay(req, &fingerprint, &prior, result);
                        }
                        Ok(Ok(None)) => continue,
                        // First request released the key; claim again
                        Ok(Err(_)) => continue,
                        Err(_) => {
                            return Claim::Replay(OrderResult::pending(req, self.clock.utc_now()));
                        }
                    }
                }
            }
        }
    }

    fn claim_local(&self, key: &str, fingerprint: &str) -> Step {
        let now = self.clock.now();
        match self.slots.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let (done, _) = watch::channel(None);
                vacant.insert(Slot::InFlight {
                    done,
                    fingerprint: fingerprint.to_string(),
                });
                Step::Claimed
            }
            Entry::Occupied(mut occupied) => {
                let existing = match occupied.get() {
                    Slot::InFlight { done, fingerprint } => {
                        Some(Step::Wait(done.subscribe(), fingerprint.clone()))
                    }
                    Slot::Completed {
                        result,
                        fingerprint,
                        expires_at,
                    } if *expires_at > now => Some(Step::Replay(result.clone(), fingerprint.clone())),
                    Slot::Completed { .. } => None,
                };
                if let Some(step) = existing {
                    return step;
                }

                // Expired result: the key is free again
                let (done, _) = watch::channel(None);
                occupied.insert(Slot::InFlight {
                    done,
                    fingerprint: fingerprint.to_string(),
                });
                Step::Claimed
            }
        }
    }

    fn replay(&self, req: &OrderRequest, fingerprint: &str, prior: &str, result: OrderResult) -> Claim {
        if prior != fingerprint {
            warn!(
                key = %req.idempotency_key,
                "Idempotency key reused with different order parameters; returning the original result"
            );
        }
        Claim::Replay(result)
    }

    async fn claim_backend(&self, req: &OrderRequest, fingerprint: &str) -> Claim {
        let Some(backend) = &self.backend else {
            return Claim::Fresh;
        };
        let record = StoredRecord {
            fingerprint: fingerprint.to_string(),
            result: None,
        };
        let value = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => return self.backend_failed(req, &e.to_string()),
        };

        let key = backend_key(&req.idempotency_key);
        let claimed = tokio::time::timeout(
            self.backend_timeout,
            backend.set_if_absent(&key, value, self.ttl),
        )
        .await;

        match claimed {
            Ok(Ok(true)) => Claim::Fresh,
            Ok(Ok(false)) => self.adopt_remote(req, fingerprint, backend.as_ref(), &key).await,
            Ok(Err(e)) => self.backend_failed(req, &e.to_string()),
            Err(_) => self.backend_failed(
                req,
                &format!("timed out after {}ms", self.backend_timeout.as_millis()),
            ),
        }
    }

    /// Another process holds the key: return its result, or pending while it runs
    async fn adopt_remote(
        &self,
        req: &OrderRequest,
        fingerprint: &str,
        backend: &dyn CacheBackend,
        key: &str,
    ) -> Claim {
        let stored = match tokio::time::timeout(self.backend_timeout, backend.get(key)).await {
            Ok(Ok(Some(value))) => serde_json::from_value::<StoredRecord>(value).ok(),
            _ => None,
        };

        match stored {
            Some(StoredRecord {
                fingerprint: prior,
                result: Some(result),
            }) => {
                self.store_local(&req.idempotency_key, result.clone(), prior.clone());
                self.replay(req, fingerprint, &prior, result)
            }
            _ => {
                // Not ours to finish; forget the local claim so waiters re-check
                self.slots.remove(&req.idempotency_key);
                info!(key = %req.idempotency_key, "Key in flight in another process");
                Claim::Replay(OrderResult::pending(req, self.clock.utc_now()))
            }
        }
    }

    fn backend_failed(&self, req: &OrderRequest, detail: &str) -> Claim {
        self.metrics
            .cache_backend_errors
            .fetch_add(1, Ordering::Relaxed);
        match self.failure_mode {
            IdempotencyFailureMode::FailClosed => {
                self.slots.remove(&req.idempotency_key);
                warn!(
                    key = %req.idempotency_key,
                    "Idempotency backend unavailable ({}), refusing order (fail-closed)",
                    detail
                );
                Claim::Unavailable(format!("idempotency store unavailable: {}", detail))
            }
            IdempotencyFailureMode::FailOpen => {
                self.metrics
                    .idempotency_fail_open
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    key = %req.idempotency_key,
                    "Idempotency backend unavailable ({}), accepting order with duplicate risk (fail-open)",
                    detail
                );
                Claim::Fresh
            }
        }
    }

    fn store_local(&self, key: &str, result: OrderResult, fingerprint: String) {
        let expires_at = self.clock.now() + self.ttl;
        let previous = self.slots.insert(
            key.to_string(),
            Slot::Completed {
                result: result.clone(),
                fingerprint,
                expires_at,
            },
        );
        if let Some(Slot::InFlight { done, .. }) = previous {
            done.send_replace(Some(result));
        }
    }

    /// Record the terminal result for a claimed key and wake waiting duplicates
    pub async fn complete(&self, req: &OrderRequest, result: &OrderResult) {
        let fingerprint = req.fingerprint();
        self.store_local(&req.idempotency_key, result.clone(), fingerprint.clone());

        let Some(backend) = &self.backend else {
            return;
        };
        let record = StoredRecord {
            fingerprint,
            result: Some(result.clone()),
        };
        let Ok(value) = serde_json::to_value(&record) else {
            return;
        };
        let stored = tokio::time::timeout(
            self.backend_timeout,
            backend.set(&backend_key(&req.idempotency_key), value, self.ttl),
        )
        .await;
        if !matches!(stored, Ok(Ok(()))) {
            self.metrics
                .cache_backend_errors
                .fetch_add(1, Ordering::Relaxed);
            error!(
                key = %req.idempotency_key,
                "Failed to persist order result; duplicates in other processes are not protected"
            );
        }
    }

    /// Give the key back without recording a result; waiters retry the claim
    pub async fn release(&self, key: &str) {
        self.slots
            .remove_if(key, |_, slot| matches!(slot, Slot::InFlight { .. }));

        if let Some(backend) = &self.backend {
            let deleted =
                tokio::time::timeout(self.backend_timeout, backend.delete(&backend_key(key))).await;
            if !matches!(deleted, Ok(Ok(()))) {
                warn!(key = %key, "Failed to release idempotency key in backend");
            }
        }
    }

    /// Drop completed entries past their TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Completed { expires_at, .. } => *expires_at > now,
            Slot::InFlight { .. } => true,
        });
        before.saturating_sub(self.slots.len())
    }
}
