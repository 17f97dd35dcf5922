//! Error types for Warden.

use thiserror::Error;

use crate::context::ContextError;
use crate::store::StoreError;

/// Main error type for Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Caller supplied an invalid key, limit, or window.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing store failed while serving an operation.
    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: StoreError,
    },

    /// A shared backend was requested without a store to run against.
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// A blocking operation gave up because its context finished first.
    #[error("{operation} canceled: {source}")]
    Cancelled {
        operation: &'static str,
        #[source]
        source: ContextError,
    },

    /// The lock is held under a token this manager did not issue.
    #[error("Lock not owned: {0}")]
    NotOwner(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WardenError {
    /// Wrap a store failure with the operation that hit it.
    pub fn backend(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| WardenError::Backend { context, source }
    }
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
