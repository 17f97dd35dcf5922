//! Warden - Rate Limiting and Lock Coordination
//!
//! This crate provides two coordination primitives behind a common lifecycle:
//! a rate limiter (exact in-process sliding window, or a fixed window over a
//! shared key-value store) and a lock manager (in-process mutex, or a
//! set-if-absent lock in a shared store). The backend for each is chosen once
//! from configuration.

pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod manager;
pub mod observability;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
pub mod validate;

pub use config::{Driver, WardenConfig};
pub use context::{Context, ContextError};
pub use error::{Result, WardenError};
pub use lock::{LockBackend, LockManager};
pub use manager::Manager;
pub use observability::{MetricsSink, Observability, PrometheusMetrics};
pub use ratelimit::{LimiterBackend, RateLimiter};
pub use store::{KvStore, MemoryStore, StoreError};
