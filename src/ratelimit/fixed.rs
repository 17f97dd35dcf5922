//! Fixed-window rate limiter backed by a shared key-value store.
//!
//! Each key maps to one integer counter at `<prefix><key>`. The first
//! increment of a window attaches a TTL equal to the window; when the TTL
//! fires the counter disappears and the next increment starts a new window.
//!
//! This is a fixed window, not a sliding one: a client can spend its full
//! limit at the end of one window and again at the start of the next, so up
//! to `2 * limit` admissions can land inside any single window-length span
//! that straddles a boundary.
//!
//! Increment and expiry are two separate store calls. If the process dies
//! between them the counter is left without a TTL and the key stays limited
//! until the counter is removed by hand.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::RateLimiter;
use crate::context::Context;
use crate::error::{Result, WardenError};
use crate::manager::Manager;
use crate::observability::Observability;
use crate::store::{KvStore, StoreError};
use crate::validate::validate_rate_limit;

/// Default prefix for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "limiter:";

/// Fixed-window limiter shared by every node that talks to the same store.
pub struct FixedWindowLimiter {
    store: Arc<dyn KvStore>,
    key_prefix: String,
    obs: Observability,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            obs: Observability::new("ratelimit"),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_observability(mut self, obs: Observability) -> Self {
        self.obs = obs;
        self
    }

    /// Store key holding the counter for `key`.
    pub fn counter_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Count one request for `key` and report whether it is within `limit`.
    pub async fn allow(
        &self,
        ctx: &Context,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<bool> {
        let driver = self.store.name();
        self.obs
            .record(driver, "allow", key, async {
                validate_rate_limit(key, limit, window)?;

                let counter_key = self.counter_key(key);
                let count = self
                    .store
                    .increment(ctx, &counter_key, 1)
                    .await
                    .map_err(WardenError::backend("failed to increment counter"))?;

                if count == 1 {
                    self.store
                        .expire(ctx, &counter_key, window)
                        .await
                        .map_err(WardenError::backend("failed to set expiration"))?;
                    debug!(window = ?window, "Started new fixed window");
                }

                let allowed = u64::try_from(count).map_or(true, |count| count <= limit);
                trace!(count, limit, allowed, "Fixed window decision");
                self.obs.record_allowance(driver, allowed);
                Ok(allowed)
            })
            .await
    }

    /// Requests left for `key` in the current window, without counting one.
    ///
    /// A missing counter is reported as a fresh window with the full `limit`.
    pub async fn remaining(
        &self,
        ctx: &Context,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<u64> {
        self.obs
            .record(self.store.name(), "get_remaining", key, async {
                validate_rate_limit(key, limit, window)?;

                let counter_key = self.counter_key(key);
                let raw = self
                    .store
                    .get(ctx, &counter_key)
                    .await
                    .map_err(WardenError::backend("failed to read counter"))?;

                let Some(raw) = raw else {
                    return Ok(limit);
                };
                let count: i64 = raw.trim().parse().map_err(|_| WardenError::Backend {
                    context: "failed to read counter",
                    source: StoreError::NotAnInteger { key: counter_key },
                })?;
                Ok(limit.saturating_sub(u64::try_from(count).unwrap_or(0)))
            })
            .await
    }
}

#[async_trait]
impl Manager for FixedWindowLimiter {
    fn name(&self) -> &'static str {
        "shared_rate_limiter"
    }

    async fn health(&self) -> Result<()> {
        self.store
            .health()
            .await
            .map_err(WardenError::backend("store health check failed"))
    }

    async fn start(&self) -> Result<()> {
        self.store
            .start()
            .await
            .map_err(WardenError::backend("failed to start store"))
    }

    async fn stop(&self) -> Result<()> {
        self.store
            .stop()
            .await
            .map_err(WardenError::backend("failed to stop store"))
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn allow(&self, ctx: &Context, key: &str, limit: u64, window: Duration) -> Result<bool> {
        FixedWindowLimiter::allow(self, ctx, key, limit, window).await
    }

    async fn remaining(
        &self,
        ctx: &Context,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<u64> {
        FixedWindowLimiter::remaining(self, ctx, key, limit, window).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreResult};

    const SECOND: Duration = Duration::from_secs(1);

    fn ctx() -> Context {
        Context::background()
    }

    fn limiter() -> (Arc<MemoryStore>, FixedWindowLimiter) {
        let store = Arc::new(MemoryStore::new());
        let limiter = FixedWindowLimiter::new(store.clone());
        (store, limiter)
    }

    /// Memory store whose `expire` always fails, as if the process died mid-call.
    struct LostExpireStore(MemoryStore);

    #[async_trait]
    impl KvStore for LostExpireStore {
        fn name(&self) -> &'static str {
            "lost-expire"
        }

        async fn get(&self, ctx: &Context, key: &str) -> StoreResult<Option<String>> {
            self.0.get(ctx, key).await
        }

        async fn set(
            &self,
            ctx: &Context,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> StoreResult<()> {
            self.0.set(ctx, key, value, ttl).await
        }

        async fn set_nx(
            &self,
            ctx: &Context,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> StoreResult<bool> {
            self.0.set_nx(ctx, key, value, ttl).await
        }

        async fn increment(&self, ctx: &Context, key: &str, delta: i64) -> StoreResult<i64> {
            self.0.increment(ctx, key, delta).await
        }

        async fn expire(&self, _ctx: &Context, _key: &str, _ttl: Duration) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }

        async fn delete(&self, ctx: &Context, key: &str) -> StoreResult<()> {
            self.0.delete(ctx, key).await
        }

        async fn ttl(&self, ctx: &Context, key: &str) -> StoreResult<Option<Duration>> {
            self.0.ttl(ctx, key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_call_in_window_rejected() {
        let (_, limiter) = limiter();

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(limiter.allow(&ctx(), "user:1", 3, SECOND).await.unwrap());
        }

        assert_eq!(results, vec![true, true, true, false]);
        assert_eq!(limiter.remaining(&ctx(), "user:1", 3, SECOND).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_attached_once_per_window() {
        let (store, limiter) = limiter();

        limiter.allow(&ctx(), "k", 10, SECOND).await.unwrap();
        assert_eq!(store.ttl(&ctx(), "limiter:k").await.unwrap(), Some(SECOND));

        tokio::time::advance(Duration::from_millis(400)).await;
        limiter.allow(&ctx(), "k", 10, SECOND).await.unwrap();

        // The second increment must not push the expiry out.
        assert_eq!(
            store.ttl(&ctx(), "limiter:k").await.unwrap(),
            Some(Duration::from_millis(600))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_resets_after_window() {
        let (store, limiter) = limiter();
        for _ in 0..4 {
            limiter.allow(&ctx(), "user:1", 3, SECOND).await.unwrap();
        }

        tokio::time::advance(SECOND + Duration::from_millis(1)).await;

        assert_eq!(store.get(&ctx(), "limiter:user:1").await.unwrap(), None);
        assert!(limiter.allow(&ctx(), "user:1", 3, SECOND).await.unwrap());
        assert_eq!(limiter.remaining(&ctx(), "user:1", 3, SECOND).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_burst_bounded_by_twice_limit() {
        let (_, limiter) = limiter();
        let limit = 3;
        let mut admitted = 0;

        // Open the window, then idle until just before it closes.
        assert!(limiter.allow(&ctx(), "burst", limit, SECOND).await.unwrap());
        tokio::time::advance(Duration::from_millis(900)).await;

        for _ in 0..limit {
            if limiter.allow(&ctx(), "burst", limit, SECOND).await.unwrap() {
                admitted += 1;
            }
        }
        tokio::time::advance(Duration::from_millis(150)).await;
        for _ in 0..limit + 2 {
            if limiter.allow(&ctx(), "burst", limit, SECOND).await.unwrap() {
                admitted += 1;
            }
        }

        // 2 at the end of the first window, 3 at the start of the next,
        // all within 150ms of each other.
        assert_eq!(admitted, 5);
        assert!(admitted > limit);
        assert!(admitted <= 2 * limit);
    }

    #[tokio::test]
    async fn test_remaining_without_counter_is_full_limit() {
        let (store, limiter) = limiter();

        assert_eq!(limiter.remaining(&ctx(), "fresh", 9, SECOND).await.unwrap(), 9);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_remaining_rejects_corrupt_counter() {
        let (store, limiter) = limiter();
        store
            .set(&ctx(), "limiter:bad", "not-a-number", Duration::ZERO)
            .await
            .unwrap();

        let err = limiter.remaining(&ctx(), "bad", 5, SECOND).await.unwrap_err();
        assert!(err.to_string().contains("failed to read counter"));
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let store = Arc::new(MemoryStore::new());
        let limiter = FixedWindowLimiter::new(store.clone()).with_key_prefix("rl:");

        limiter.allow(&ctx(), "k", 1, SECOND).await.unwrap();

        assert_eq!(store.get(&ctx(), "rl:k").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_arguments_do_not_touch_store() {
        let (store, limiter) = limiter();

        assert!(limiter.allow(&ctx(), "", 1, SECOND).await.is_err());
        assert!(limiter.allow(&ctx(), "k", 0, SECOND).await.is_err());
        assert!(limiter.allow(&ctx(), "k", 1, Duration::ZERO).await.is_err());

        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_expire_leaves_counter_without_ttl() {
        let store = Arc::new(LostExpireStore(MemoryStore::new()));
        let limiter = FixedWindowLimiter::new(store.clone());

        let err = limiter.allow(&ctx(), "k", 2, SECOND).await.unwrap_err();
        assert!(err.to_string().contains("failed to set expiration"));
        assert_eq!(store.ttl(&ctx(), "limiter:k").await.unwrap(), None);

        assert!(limiter.allow(&ctx(), "k", 2, SECOND).await.unwrap());
        assert!(!limiter.allow(&ctx(), "k", 2, SECOND).await.unwrap());

        // Without a TTL the window never closes.
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!limiter.allow(&ctx(), "k", 2, SECOND).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_beyond_clock_range() {
        let (store, limiter) = limiter();

        assert!(limiter.allow(&ctx(), "k", 3, Duration::MAX).await.unwrap());
        assert_eq!(store.ttl(&ctx(), "limiter:k").await.unwrap(), None);
        assert_eq!(limiter.remaining(&ctx(), "k", 3, Duration::MAX).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_health_delegates_to_store() {
        let (_, limiter) = limiter();
        assert!(limiter.health().await.is_ok());
        assert_eq!(limiter.name(), "shared_rate_limiter");
    }
}
