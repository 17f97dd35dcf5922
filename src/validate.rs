//! Argument checks shared by the limiter and lock managers.
//!
//! Each check runs before any backend state is touched, so a rejected call
//! leaves nothing behind.

use std::time::Duration;

use crate::error::{Result, WardenError};

pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(WardenError::InvalidArgument(
            "key cannot be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_limit(limit: u64) -> Result<()> {
    if limit == 0 {
        return Err(WardenError::InvalidArgument(
            "limit must be positive".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_window(window: Duration) -> Result<()> {
    if window.is_zero() {
        return Err(WardenError::InvalidArgument(
            "window must be positive".to_string(),
        ));
    }
    Ok(())
}

/// All three checks a rate limit call needs, in argument order.
pub fn validate_rate_limit(key: &str, limit: u64, window: Duration) -> Result<()> {
    validate_key(key)?;
    validate_limit(limit)?;
    validate_window(window)
}
