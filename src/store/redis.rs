//! Redis-backed key-value store.
//!
//! Connections go through `redis::aio::ConnectionManager`, which reconnects
//! on its own and is cheap to clone, so every call works on its own clone
//! instead of serializing on a shared connection.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::info;

use super::{KvStore, StoreError, StoreResult};
use crate::config::StoreConfig;
use crate::context::Context;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// A [`KvStore`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    compare_and_delete: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect using the store section of the configuration.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        Self::connect_url(&config.url()).await
    }

    /// Connect to a Redis URL such as `redis://127.0.0.1/`.
    pub async fn connect_url(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(map_err)?;
        let connection = ConnectionManager::new(client).await.map_err(map_err)?;
        info!("Connected to Redis store");

        Ok(Self {
            connection,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }

    /// Run a command unless the caller's context finishes first.
    async fn run<T, F>(&self, ctx: &Context, command: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        tokio::select! {
            reason = ctx.done() => {
                Err(StoreError::Backend(format!("request abandoned: {}", reason)))
            }
            result = command => result.map_err(map_err),
        }
    }
}

fn map_err(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().try_into().unwrap_or(u64::MAX)
}

#[async_trait]
impl KvStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn health(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn get(&self, ctx: &Context, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection.clone();
        self.run(ctx, redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn set(&self, ctx: &Context, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(millis(ttl));
        }
        self.run(ctx, cmd.query_async(&mut conn)).await
    }

    async fn set_nx(
        &self,
        ctx: &Context,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if !ttl.is_zero() {
            cmd.arg("PX").arg(millis(ttl));
        }
        let reply: Option<String> = self.run(ctx, cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn increment(&self, ctx: &Context, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        let result = self
            .run(
                ctx,
                redis::cmd("INCRBY").arg(key).arg(delta).query_async(&mut conn),
            )
            .await;
        match result {
            Err(StoreError::Backend(msg)) if msg.contains("not an integer") => {
                Err(StoreError::NotAnInteger {
                    key: key.to_string(),
                })
            }
            other => other,
        }
    }

    async fn expire(&self, ctx: &Context, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: i64 = if ttl.is_zero() {
            self.run(ctx, redis::cmd("PERSIST").arg(key).query_async(&mut conn))
                .await?
        } else {
            self.run(
                ctx,
                redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(millis(ttl))
                    .query_async(&mut conn),
            )
            .await?
        };
        Ok(())
    }

    async fn delete(&self, ctx: &Context, key: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .run(ctx, redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn ttl(&self, ctx: &Context, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.connection.clone();
        let pttl: i64 = self
            .run(ctx, redis::cmd("PTTL").arg(key).query_async(&mut conn))
            .await?;
        // -2: no such key, -1: no expiry.
        Ok(u64::try_from(pttl).ok().map(Duration::from_millis))
    }

    async fn compare_and_delete(
        &self,
        ctx: &Context,
        key: &str,
        expected: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let mut invocation = self.compare_and_delete.key(key);
        invocation.arg(expected);
        let deleted: i64 = self.run(ctx, invocation.invoke_async(&mut conn)).await?;
        Ok(deleted > 0)
    }
}
