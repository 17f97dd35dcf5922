//! Rate limiter trait and the backend selected from configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{FixedWindowLimiter, SlidingWindowLimiter};
use crate::config::{Driver, LimiterConfig};
use crate::context::Context;
use crate::error::{Result, WardenError};
use crate::manager::Manager;
use crate::observability::Observability;
use crate::store::KvStore;

/// Trait for rate limiter implementations.
///
/// Both calls validate their arguments before touching any state:
/// `key` must be non-empty, `limit` positive and `window` non-zero.
#[async_trait]
pub trait RateLimiter: Manager {
    /// Decide whether one more request for `key` fits in the window.
    /// An admitted request is counted; a rejected one is not.
    async fn allow(&self, ctx: &Context, key: &str, limit: u64, window: Duration) -> Result<bool>;

    /// How many more requests `key` may make right now. Never counts one.
    async fn remaining(
        &self,
        ctx: &Context,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<u64>;
}

/// The rate limiter chosen by the `driver` setting.
pub enum LimiterBackend {
    Memory(SlidingWindowLimiter),
    Shared(FixedWindowLimiter),
}

impl LimiterBackend {
    /// Build the limiter named by `config.driver`.
    ///
    /// The `redis` driver needs a store; without one this fails with
    /// [`WardenError::NotConfigured`] instead of failing on first use.
    pub fn from_config(
        config: &LimiterConfig,
        store: Option<Arc<dyn KvStore>>,
        obs: Observability,
    ) -> Result<Self> {
        let mut config = config.clone();
        let driver = config.validate()?;

        let backend = match driver {
            Driver::Memory => LimiterBackend::Memory(SlidingWindowLimiter::with_observability(obs)),
            Driver::Redis => {
                let store = store.ok_or_else(|| {
                    WardenError::NotConfigured(
                        "redis rate limiter requires a key-value store".to_string(),
                    )
                })?;
                LimiterBackend::Shared(
                    FixedWindowLimiter::new(store)
                        .with_key_prefix(config.key_prefix)
                        .with_observability(obs),
                )
            }
        };

        info!(driver = %driver, manager = backend.name(), "Rate limiter created");
        Ok(backend)
    }

    pub fn driver(&self) -> Driver {
        match self {
            LimiterBackend::Memory(_) => Driver::Memory,
            LimiterBackend::Shared(_) => Driver::Redis,
        }
    }
}

#[async_trait]
impl Manager for LimiterBackend {
    fn name(&self) -> &'static str {
        match self {
            LimiterBackend::Memory(limiter) => limiter.name(),
            LimiterBackend::Shared(limiter) => limiter.name(),
        }
    }

    async fn health(&self) -> Result<()> {
        match self {
            LimiterBackend::Memory(limiter) => limiter.health().await,
            LimiterBackend::Shared(limiter) => limiter.health().await,
        }
    }

    async fn start(&self) -> Result<()> {
        match self {
            LimiterBackend::Memory(limiter) => limiter.start().await,
            LimiterBackend::Shared(limiter) => limiter.start().await,
        }
    }

    async fn stop(&self) -> Result<()> {
        match self {
            LimiterBackend::Memory(limiter) => limiter.stop().await,
            LimiterBackend::Shared(limiter) => limiter.stop().await,
        }
    }
}

#[async_trait]
impl RateLimiter for LimiterBackend {
    async fn allow(&self, ctx: &Context, key: &str, limit: u64, window: Duration) -> Result<bool> {
        match self {
            LimiterBackend::Memory(limiter) => limiter.allow(ctx, key, limit, window).await,
            LimiterBackend::Shared(limiter) => limiter.allow(ctx, key, limit, window).await,
        }
    }

    async fn remaining(
        &self,
        ctx: &Context,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<u64> {
        match self {
            LimiterBackend::Memory(limiter) => limiter.remaining(ctx, key, limit, window).await,
            LimiterBackend::Shared(limiter) => limiter.remaining(ctx, key, limit, window).await,
        }
    }
}
