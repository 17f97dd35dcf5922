//! Lock manager trait and the backend selected from configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{DistributedLockManager, LocalLockManager};
use crate::config::{Driver, LockConfig};
use crate::context::Context;
use crate::error::{Result, WardenError};
use crate::manager::Manager;
use crate::observability::Observability;
use crate::store::KvStore;

/// Mutual exclusion on string keys.
///
/// A `ttl` of [`Duration::ZERO`] asks for a lock that never expires.
#[async_trait]
pub trait LockManager: Manager {
    /// Block until `key` is acquired or `ctx` is done.
    async fn lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<()>;

    /// Acquire `key` if it is free right now. Never blocks.
    async fn try_lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<bool>;

    /// Release `key`. Releasing a lock that is not held is not an error.
    async fn unlock(&self, ctx: &Context, key: &str) -> Result<()>;
}

/// The lock manager chosen by the `driver` setting.
pub enum LockBackend {
    Memory(LocalLockManager),
    Shared(DistributedLockManager),
}

impl LockBackend {
    /// Build the lock manager named by `config.driver`.
    pub fn from_config(
        config: &LockConfig,
        store: Option<Arc<dyn KvStore>>,
        obs: Observability,
    ) -> Result<Self> {
        let mut config = config.clone();
        let driver = config.validate()?;

        let backend = match driver {
            Driver::Memory => LockBackend::Memory(LocalLockManager::with_observability(obs)),
            Driver::Redis => {
                let store = store.ok_or_else(|| {
                    WardenError::NotConfigured(
                        "redis lock manager requires a key-value store".to_string(),
                    )
                })?;
                LockBackend::Shared(
                    DistributedLockManager::new(store)
                        .with_key_prefix(config.key_prefix)
                        .with_retry_interval(config.retry_interval)
                        .with_owner_check(config.verify_owner)
                        .with_observability(obs),
                )
            }
        };

        info!(driver = %driver, manager = backend.name(), "Lock manager created");
        Ok(backend)
    }

    pub fn driver(&self) -> Driver {
        match self {
            LockBackend::Memory(_) => Driver::Memory,
            LockBackend::Shared(_) => Driver::Redis,
        }
    }
}

#[async_trait]
impl Manager for LockBackend {
    fn name(&self) -> &'static str {
        match self {
            LockBackend::Memory(locks) => locks.name(),
            LockBackend::Shared(locks) => locks.name(),
        }
    }

    async fn health(&self) -> Result<()> {
        match self {
            LockBackend::Memory(locks) => locks.health().await,
            LockBackend::Shared(locks) => locks.health().await,
        }
    }

    async fn start(&self) -> Result<()> {
        match self {
            LockBackend::Memory(locks) => locks.start().await,
            LockBackend::Shared(locks) => locks.start().await,
        }
    }

    async fn stop(&self) -> Result<()> {
        match self {
            LockBackend::Memory(locks) => locks.stop().await,
            LockBackend::Shared(locks) => locks.stop().await,
        }
    }
}

#[async_trait]
impl LockManager for LockBackend {
    async fn lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<()> {
        match self {
            LockBackend::Memory(locks) => locks.lock(ctx, key, ttl).await,
            LockBackend::Shared(locks) => locks.lock(ctx, key, ttl).await,
        }
    }

    async fn try_lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<bool> {
        match self {
            LockBackend::Memory(locks) => locks.try_lock(ctx, key, ttl).await,
            LockBackend::Shared(locks) => locks.try_lock(ctx, key, ttl).await,
        }
    }

    async fn unlock(&self, ctx: &Context, key: &str) -> Result<()> {
        match self {
            LockBackend::Memory(locks) => locks.unlock(ctx, key).await,
            LockBackend::Shared(locks) => locks.unlock(ctx, key).await,
        }
    }
}
