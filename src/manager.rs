//! Lifecycle hooks shared by every manager.

use async_trait::async_trait;

use crate::error::Result;

/// Lifecycle of a coordination manager.
///
/// In-process backends have nothing to start or check and return `Ok`.
/// Store-backed ones forward to their store.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn health(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}
