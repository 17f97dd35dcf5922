//! Rate limiting: an exact in-process sliding window and a fixed window
//! over a shared store.

mod backend;
mod fixed;
mod sliding;

pub use backend::{LimiterBackend, RateLimiter};
pub use fixed::{FixedWindowLimiter, DEFAULT_KEY_PREFIX};
pub use sliding::SlidingWindowLimiter;
