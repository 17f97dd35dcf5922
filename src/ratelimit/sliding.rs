//! In-process sliding-window rate limiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::RateLimiter;
use crate::context::Context;
use crate::error::Result;
use crate::manager::Manager;
use crate::observability::Observability;
use crate::validate::validate_rate_limit;

const DRIVER: &str = "memory";

/// Admission history for a single key.
///
/// `events` is ordered oldest first, so pruning only ever pops from the front.
struct WindowEntry {
    events: VecDeque<Instant>,
    limit: u64,
    window: Duration,
}

impl WindowEntry {
    fn new(limit: u64, window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            limit,
            window,
        }
    }

    /// Drop every event at or before `now - window`.
    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while matches!(self.events.front(), Some(&at) if at <= cutoff) {
            self.events.pop_front();
        }
    }

    /// Events still inside `window`, without touching the history.
    fn live_count(&self, now: Instant, window: Duration) -> u64 {
        match now.checked_sub(window) {
            Some(cutoff) => self.events.iter().filter(|&&at| at > cutoff).count() as u64,
            None => self.events.len() as u64,
        }
    }
}

/// Exact sliding-window limiter keeping per-key timestamps in memory.
///
/// At any instant at most `limit` calls inside the trailing `window` have
/// been admitted for a key. Entries are created on the first `allow` for a
/// key and live for the lifetime of the limiter; expired timestamps are
/// dropped lazily on the next call for that key.
///
/// The `limit` and `window` passed on each call replace the ones stored for
/// the key, so callers must pass consistent values for a given key.
pub struct SlidingWindowLimiter {
    entries: DashMap<String, Arc<Mutex<WindowEntry>>>,
    obs: Observability,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::with_observability(Observability::new("ratelimit"))
    }

    pub fn with_observability(obs: Observability) -> Self {
        Self {
            entries: DashMap::new(),
            obs,
        }
    }

    /// Record one event for `key` if fewer than `limit` fall inside `window`.
    pub async fn allow(
        &self,
        _ctx: &Context,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<bool> {
        self.obs
            .record(DRIVER, "allow", key, async {
                validate_rate_limit(key, limit, window)?;

                let entry = {
                    let slot = self.entries.entry(key.to_string()).or_insert_with(|| {
                        debug!(limit, window = ?window, "Creating sliding window entry");
                        Arc::new(Mutex::new(WindowEntry::new(limit, window)))
                    });
                    Arc::clone(slot.value())
                };

                let (allowed, in_window) = {
                    let mut entry = entry.lock();
                    entry.limit = limit;
                    entry.window = window;

                    let now = Instant::now();
                    entry.prune(now);
                    let allowed = (entry.events.len() as u64) < entry.limit;
                    if allowed {
                        entry.events.push_back(now);
                    }
                    (allowed, entry.events.len())
                };

                trace!(allowed, in_window, limit, "Sliding window decision");
                self.obs.record_allowance(DRIVER, allowed);
                Ok(allowed)
            })
            .await
    }

    /// Admissions left for `key` in the current window.
    ///
    /// A key that has never been seen has its full `limit` available.
    pub async fn remaining(
        &self,
        _ctx: &Context,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<u64> {
        self.obs
            .record(DRIVER, "get_remaining", key, async {
                validate_rate_limit(key, limit, window)?;

                let Some(entry) = self.entries.get(key).map(|slot| Arc::clone(slot.value())) else {
                    return Ok(limit);
                };
                let used = entry.lock().live_count(Instant::now(), window);
                Ok(limit.saturating_sub(used))
            })
            .await
    }

    /// Number of keys with an entry.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Manager for SlidingWindowLimiter {
    fn name(&self) -> &'static str {
        "memory_rate_limiter"
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn allow(&self, ctx: &Context, key: &str, limit: u64, window: Duration) -> Result<bool> {
        SlidingWindowLimiter::allow(self, ctx, key, limit, window).await
    }

    async fn remaining(
        &self,
        ctx: &Context,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<u64> {
        SlidingWindowLimiter::remaining(self, ctx, key, limit, window).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WardenError;
    use futures::future::join_all;

    const SECOND: Duration = Duration::from_secs(1);

    fn ctx() -> Context {
        Context::background()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_call_in_window_rejected() {
        let limiter = SlidingWindowLimiter::new();

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(limiter.allow(&ctx(), "user:1", 3, SECOND).await.unwrap());
        }

        assert_eq!(results, vec![true, true, true, false]);
        assert_eq!(limiter.remaining(&ctx(), "user:1", 3, SECOND).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls_over() {
        let limiter = SlidingWindowLimiter::new();
        for _ in 0..4 {
            limiter.allow(&ctx(), "user:1", 3, SECOND).await.unwrap();
        }

        tokio::time::advance(SECOND + Duration::from_millis(1)).await;

        assert!(limiter.allow(&ctx(), "user:1", 3, SECOND).await.unwrap());
        assert_eq!(limiter.remaining(&ctx(), "user:1", 3, SECOND).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides_instead_of_resetting() {
        let limiter = SlidingWindowLimiter::new();

        assert!(limiter.allow(&ctx(), "k", 2, SECOND).await.unwrap());
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.allow(&ctx(), "k", 2, SECOND).await.unwrap());
        tokio::time::advance(Duration::from_millis(600)).await;

        // The first event has left the window, the second has not.
        assert!(limiter.allow(&ctx(), "k", 2, SECOND).await.unwrap());
        assert!(!limiter.allow(&ctx(), "k", 2, SECOND).await.unwrap());
    }

    #[tokio::test]
    async fn test_remaining_tracks_admissions() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(60);

        for used in 1..=5 {
            assert!(limiter.allow(&ctx(), "api", 10, window).await.unwrap());
            assert_eq!(
                limiter.remaining(&ctx(), "api", 10, window).await.unwrap(),
                10 - used
            );
        }
    }

    #[tokio::test]
    async fn test_remaining_unknown_key_is_full_limit() {
        let limiter = SlidingWindowLimiter::new();

        assert_eq!(limiter.remaining(&ctx(), "nobody", 7, SECOND).await.unwrap(), 7);
        assert_eq!(limiter.key_count(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = SlidingWindowLimiter::new();

        assert!(limiter.allow(&ctx(), "a", 1, SECOND).await.unwrap());
        assert!(!limiter.allow(&ctx(), "a", 1, SECOND).await.unwrap());
        assert!(limiter.allow(&ctx(), "b", 1, SECOND).await.unwrap());
        assert_eq!(limiter.key_count(), 2);
    }

    #[tokio::test]
    async fn test_new_limit_applies_immediately() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(60);

        assert!(limiter.allow(&ctx(), "k", 2, window).await.unwrap());
        assert!(limiter.allow(&ctx(), "k", 2, window).await.unwrap());
        assert!(!limiter.allow(&ctx(), "k", 2, window).await.unwrap());

        // Raising the limit opens room right away.
        assert!(limiter.allow(&ctx(), "k", 3, window).await.unwrap());

        // Lowering it leaves more events than the limit; remaining stays at zero.
        assert!(!limiter.allow(&ctx(), "k", 1, window).await.unwrap());
        assert_eq!(limiter.remaining(&ctx(), "k", 1, window).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_arguments_leave_no_state() {
        let limiter = SlidingWindowLimiter::new();

        let err = limiter.allow(&ctx(), "", 1, SECOND).await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidArgument(_)));
        let err = limiter.allow(&ctx(), "k", 0, SECOND).await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidArgument(_)));
        let err = limiter.allow(&ctx(), "k", 1, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidArgument(_)));
        let err = limiter.remaining(&ctx(), "k", 0, SECOND).await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidArgument(_)));

        assert_eq!(limiter.key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_window_never_exceeds_limit() {
        let limiter = SlidingWindowLimiter::new();
        let limit = 5;
        let window = Duration::from_millis(1000);
        let start = Instant::now();
        let mut admitted: Vec<Duration> = Vec::new();

        // Deterministic pseudo-random gaps between 0 and 249ms.
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        for _ in 0..400 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            tokio::time::advance(Duration::from_millis((seed >> 33) % 250)).await;

            if limiter.allow(&ctx(), "prop", limit, window).await.unwrap() {
                let now = start.elapsed();
                admitted.push(now);
                let in_window = admitted
                    .iter()
                    .filter(|&&at| at + window > now)
                    .count() as u64;
                assert!(in_window <= limit, "{} admitted within window at {:?}", in_window, now);
            }
        }

        assert!(!admitted.is_empty());
    }

    #[tokio::test]
    async fn test_clear_forgets_keys() {
        let limiter = SlidingWindowLimiter::new();
        limiter.allow(&ctx(), "k", 1, SECOND).await.unwrap();
        assert_eq!(limiter.key_count(), 1);

        limiter.clear();

        assert_eq!(limiter.key_count(), 0);
        assert!(limiter.allow(&ctx(), "k", 1, SECOND).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allow_admits_exactly_limit() {
        let limiter = Arc::new(SlidingWindowLimiter::new());
        let window = Duration::from_secs(60);

        let tasks = (0..64).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.allow(&Context::background(), "hot", 10, window).await
            })
        });
        let admitted = join_all(tasks)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap().as_ref().unwrap())
            .count();

        assert_eq!(admitted, 10);
    }
}
