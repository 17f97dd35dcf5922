//! Key-value store abstraction used by the shared backends.
//!
//! The shared rate limiter and the distributed lock only need a narrow
//! surface: plain get/set, set-if-absent, atomic increment, expiry and
//! delete. Anything that can provide those with TTL semantics (a single
//! Redis node, a cluster, or the in-process [`MemoryStore`]) can back them.

mod memory;
#[cfg(feature = "redis-store")]
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::Context;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

/// Errors surfaced by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An increment hit a value that is not an integer.
    #[error("value at key {key} is not an integer")]
    NotAnInteger { key: String },

    /// Any other failure reported by the store.
    #[error("store error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-value store with TTL semantics.
///
/// A `ttl` of [`Duration::ZERO`] means the key never expires.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    async fn health(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn start(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn stop(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Read a value; `None` if the key is absent or expired.
    async fn get(&self, ctx: &Context, key: &str) -> StoreResult<Option<String>>;

    /// Write a value unconditionally, replacing any previous TTL.
    async fn set(&self, ctx: &Context, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Write a value only if the key is absent. Returns whether the write happened.
    async fn set_nx(&self, ctx: &Context, key: &str, value: &str, ttl: Duration)
        -> StoreResult<bool>;

    /// Atomically add `delta` and return the new value.
    ///
    /// An absent key starts from zero and carries no TTL.
    async fn increment(&self, ctx: &Context, key: &str, delta: i64) -> StoreResult<i64>;

    /// Attach a TTL to an existing key. A missing key is not an error.
    async fn expire(&self, ctx: &Context, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn delete(&self, ctx: &Context, key: &str) -> StoreResult<()>;

    /// Remaining lifetime of a key; `None` if absent or if it never expires.
    async fn ttl(&self, ctx: &Context, key: &str) -> StoreResult<Option<Duration>>;

    /// Delete `key` only while it still holds `expected`.
    ///
    /// The default is a read followed by a delete and is not atomic;
    /// implementations that can do better should override it.
    async fn compare_and_delete(
        &self,
        ctx: &Context,
        key: &str,
        expected: &str,
    ) -> StoreResult<bool> {
        match self.get(ctx, key).await? {
            Some(current) if current == expected => {
                self.delete(ctx, key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
