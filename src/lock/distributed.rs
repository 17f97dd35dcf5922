//! Distributed lock manager on top of a shared key-value store.
//!
//! A lock is a key `<prefix><key>` written with set-if-absent and the lock's
//! ttl. Every acquisition writes a fresh random token. By default release is
//! an unconditional delete, so any holder of the manager can release any
//! lock. With the owner check enabled the manager remembers the token it
//! wrote and releases through an atomic compare-and-delete instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::backend::LockManager;
use crate::context::Context;
use crate::error::{Result, WardenError};
use crate::manager::Manager;
use crate::observability::Observability;
use crate::store::KvStore;
use crate::validate::validate_key;

/// Default prefix for lock keys.
pub const DEFAULT_KEY_PREFIX: &str = "lock:";

/// Default pause between acquisition attempts in [`DistributedLockManager::lock`].
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

pub struct DistributedLockManager {
    store: Arc<dyn KvStore>,
    key_prefix: String,
    retry_interval: Duration,
    verify_owner: bool,
    /// Token written for each key we hold. Only kept with the owner check on.
    tokens: DashMap<String, String>,
    obs: Observability,
}

impl DistributedLockManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            verify_owner: false,
            tokens: DashMap::new(),
            obs: Observability::new("lock"),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Release only locks still holding the token this manager wrote.
    ///
    /// Tokens are kept per key, so this only guards against other managers or
    /// processes sharing the store. Callers sharing one manager share its token
    /// and can release each other's locks.
    pub fn with_owner_check(mut self, verify_owner: bool) -> Self {
        self.verify_owner = verify_owner;
        self
    }

    pub fn with_observability(mut self, obs: Observability) -> Self {
        self.obs = obs;
        self
    }

    pub fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// One set-if-absent attempt. Records the acquire outcome.
    async fn attempt(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<bool> {
        let driver = self.store.name();
        let token = Uuid::new_v4().to_string();

        let acquired = match self.store.set_nx(ctx, &self.lock_key(key), &token, ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.obs.record_lock_acquire(driver, false);
                return Err(WardenError::Backend {
                    context: "failed to acquire lock",
                    source: e,
                });
            }
        };

        self.obs.record_lock_acquire(driver, acquired);
        if acquired && self.verify_owner {
            self.tokens.insert(key.to_string(), token);
        }
        Ok(acquired)
    }

    /// Poll until the lock is acquired or `ctx` is done.
    pub async fn lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<()> {
        self.obs
            .record(self.store.name(), "lock", key, async {
                validate_key(key)?;

                let mut attempts = 0u32;
                loop {
                    if let Some(reason) = ctx.err() {
                        return Err(WardenError::Cancelled {
                            operation: "lock acquisition",
                            source: reason,
                        });
                    }

                    attempts += 1;
                    if self.attempt(ctx, key, ttl).await? {
                        debug!(attempts, "Lock acquired");
                        return Ok(());
                    }
                    trace!(attempts, "Lock busy, retrying");

                    tokio::select! {
                        reason = ctx.done() => {
                            return Err(WardenError::Cancelled {
                                operation: "lock acquisition",
                                source: reason,
                            });
                        }
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
            })
            .await
    }

    pub async fn try_lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<bool> {
        self.obs
            .record(self.store.name(), "try_lock", key, async {
                validate_key(key)?;
                self.attempt(ctx, key, ttl).await
            })
            .await
    }

    pub async fn unlock(&self, ctx: &Context, key: &str) -> Result<()> {
        let driver = self.store.name();
        self.obs
            .record(driver, "unlock", key, async {
                validate_key(key)?;
                let lock_key = self.lock_key(key);

                if !self.verify_owner {
                    self.store
                        .delete(ctx, &lock_key)
                        .await
                        .map_err(WardenError::backend("failed to release lock"))?;
                    self.obs.record_lock_release(driver);
                    return Ok(());
                }

                let Some((_, token)) = self.tokens.remove(key) else {
                    debug!("Unlock of a lock this manager does not hold ignored");
                    return Ok(());
                };
                let released = self
                    .store
                    .compare_and_delete(ctx, &lock_key, &token)
                    .await
                    .map_err(WardenError::backend("failed to release lock"))?;
                if !released {
                    warn!("Lock expired or was taken over before release");
                    return Err(WardenError::NotOwner(format!(
                        "lock {} expired or is held by another owner",
                        key
                    )));
                }

                self.obs.record_lock_release(driver);
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl Manager for DistributedLockManager {
    fn name(&self) -> &'static str {
        "distributed_lock_manager"
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
impl LockManager for DistributedLockManager {
    async fn lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<()> {
        DistributedLockManager::lock(self, ctx, key, ttl).await
    }

    async fn try_lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<bool> {
        DistributedLockManager::try_lock(self, ctx, key, ttl).await
    }

    async fn unlock(&self, ctx: &Context, key: &str) -> Result<()> {
        DistributedLockManager::unlock(self, ctx, key).await
    }
}
