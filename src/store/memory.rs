//! In-process key-value store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{KvStore, StoreError, StoreResult};
use crate::context::Context;

/// Default interval between background sweeps of expired keys.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: deadline(ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Expiry instant for `ttl`. Zero and durations past the clock's range never expire.
fn deadline(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Instant::now().checked_add(ttl)
    }
}

/// A [`KvStore`] kept in process memory.
///
/// Expired keys are treated as absent on every access. They are also removed
/// by a sweeper task while the store is started, so keys that are never read
/// again do not pile up.
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Number of stored keys, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired key and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        purge(&self.entries)
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, v| v.is_expired(now));
        }
        None
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(token) = self.sweeper.get_mut().take() {
            token.cancel();
        }
    }
}

fn purge(entries: &DashMap<String, StoredValue>) -> usize {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, v| !v.is_expired(now));
    before.saturating_sub(entries.len())
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn start(&self) -> StoreResult<()> {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let entries = Arc::clone(&self.entries);
        let interval = self.sweep_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let removed = purge(&entries);
                        if removed > 0 {
                            trace!(removed, "Swept expired keys");
                        }
                    }
                }
            }
        });

        debug!(interval = ?interval, "Memory store sweeper started");
        *sweeper = Some(token);
        Ok(())
    }

    async fn stop(&self) -> StoreResult<()> {
        if let Some(token) = self.sweeper.lock().take() {
            token.cancel();
            debug!("Memory store sweeper stopped");
        }
        Ok(())
    }

    async fn get(&self, _ctx: &Context, key: &str) -> StoreResult<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn set(&self, _ctx: &Context, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value.to_string(), ttl));
        Ok(())
    }

    async fn set_nx(
        &self,
        _ctx: &Context,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::new(value.to_string(), ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value.to_string(), ttl));
                Ok(true)
            }
        }
    }

    async fn increment(&self, _ctx: &Context, key: &str, delta: i64) -> StoreResult<i64> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::new(delta.to_string(), Duration::ZERO));
                    return Ok(delta);
                }
                let current: i64 = occupied.get().value.parse().map_err(|_| {
                    StoreError::NotAnInteger {
                        key: key.to_string(),
                    }
                })?;
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| StoreError::Backend(format!("increment overflow at {}", key)))?;
                occupied.get_mut().value = next.to_string();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(delta.to_string(), Duration::ZERO));
                Ok(delta)
            }
        }
    }

    async fn expire(&self, _ctx: &Context, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = deadline(ttl);
            }
        }
        Ok(())
    }

    async fn delete(&self, _ctx: &Context, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ttl(&self, _ctx: &Context, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self.entries.get(key).and_then(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                entry.expires_at.map(|at| at.saturating_duration_since(now))
            }
        }))
    }

    async fn compare_and_delete(
        &self,
        _ctx: &Context,
        key: &str,
        expected: &str,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, v| !v.is_expired(now) && v.value == expected);
        Ok(removed.is_some())
    }
}
