//! Pluggable key/value backends for the quote cache and the idempotency store

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::coordination::{Clock, SharedClock};
use crate::error::CacheError;

/// Key/value store with per-entry TTL.
///
/// Expired entries behave exactly like missing ones for every operation.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;

    /// Atomically store `value` unless a live entry exists. Returns true if stored.
    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration)
        -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), CacheError> {
        self.get("__ping__").await.map(|_| ())
    }

    /// Drop expired entries, returning how many were removed. Backends that
    /// expire entries on their own keep the default.
    async fn purge_expired(&self) -> Result<u64, CacheError> {
        Ok(0)
    }
}

/// In-process backend over a sharded map
pub struct InMemoryBackend {
    entries: DashMap<String, (Value, Instant)>,
    clock: SharedClock,
}

impl InMemoryBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let now = self.clock.now();
        let live = self
            .entries
            .get(key)
            .and_then(|entry| (entry.1 > now).then(|| entry.0.clone()));
        if live.is_none() {
            self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        Ok(live)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = self.clock.now() + ttl;
        self.entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().1 > now {
                    Ok(false)
                } else {
                    occupied.insert((value, now + ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value, now + ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}
