//! In-process lock manager.
//!
//! Each key owns a one-permit semaphore. Acquiring forgets the permit and
//! releasing adds it back, so a lock is not tied to the task or call that
//! took it: any caller holding the manager may release it.
//!
//! The `ttl` is advisory. It is recorded at acquisition, and a release after
//! it has elapsed logs a warning, but a held lock is never taken away.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::LockManager;
use crate::context::{Context, ContextError};
use crate::error::{Result, WardenError};
use crate::manager::Manager;
use crate::observability::Observability;
use crate::validate::validate_key;

const DRIVER: &str = "memory";

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    expires_at: Option<Instant>,
}

struct LockSlot {
    permit: Semaphore,
    state: Mutex<LockState>,
}

impl LockSlot {
    fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
            state: Mutex::new(LockState::default()),
        }
    }

    /// Mark the slot held. The caller must already own the permit.
    fn mark_held(&self, ttl: Duration) {
        let mut state = self.state.lock();
        state.held = true;
        state.expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
    }
}

/// Single-process lock manager.
///
/// Slots are created on first use and kept for the lifetime of the manager.
pub struct LocalLockManager {
    slots: DashMap<String, Arc<LockSlot>>,
    obs: Observability,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::with_observability(Observability::new("lock"))
    }

    pub fn with_observability(obs: Observability) -> Self {
        Self {
            slots: DashMap::new(),
            obs,
        }
    }

    fn slot(&self, key: &str) -> Arc<LockSlot> {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LockSlot::new()));
        Arc::clone(slot.value())
    }

    pub async fn lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<()> {
        self.obs
            .record(DRIVER, "lock", key, async {
                validate_key(key)?;
                let slot = self.slot(key);

                let acquired = tokio::select! {
                    biased;
                    permit = slot.permit.acquire() => permit.ok(),
                    reason = ctx.done() => {
                        self.obs.record_lock_acquire(DRIVER, false);
                        return Err(WardenError::Cancelled {
                            operation: "lock acquisition",
                            source: reason,
                        });
                    }
                };
                let Some(permit) = acquired else {
                    // The semaphore is never closed while the manager is alive.
                    self.obs.record_lock_acquire(DRIVER, false);
                    return Err(WardenError::Cancelled {
                        operation: "lock acquisition",
                        source: ContextError::Cancelled,
                    });
                };
                permit.forget();
                slot.mark_held(ttl);

                self.obs.record_lock_acquire(DRIVER, true);
                Ok(())
            })
            .await
    }

    pub async fn try_lock(&self, _ctx: &Context, key: &str, ttl: Duration) -> Result<bool> {
        self.obs
            .record(DRIVER, "try_lock", key, async {
                validate_key(key)?;
                let slot = self.slot(key);

                let acquired = match slot.permit.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        slot.mark_held(ttl);
                        true
                    }
                    Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => false,
                };

                self.obs.record_lock_acquire(DRIVER, acquired);
                Ok(acquired)
            })
            .await
    }

    pub async fn unlock(&self, _ctx: &Context, key: &str) -> Result<()> {
        self.obs
            .record(DRIVER, "unlock", key, async {
                validate_key(key)?;
                let Some(slot) = self.slots.get(key).map(|slot| Arc::clone(slot.value())) else {
                    debug!("Unlock of unknown key ignored");
                    return Ok(());
                };

                {
                    let mut state = slot.state.lock();
                    if !state.held {
                        debug!("Unlock of free lock ignored");
                        return Ok(());
                    }
                    state.held = false;
                    if let Some(expires_at) = state.expires_at.take() {
                        let now = Instant::now();
                        if now > expires_at {
                            warn!(
                                overdue = ?now.duration_since(expires_at),
                                "Lock released after its ttl elapsed"
                            );
                        }
                    }
                    // Hand the permit back while still holding the state lock, so a
                    // concurrent unlock cannot add a second one.
                    slot.permit.add_permits(1);
                }

                self.obs.record_lock_release(DRIVER);
                Ok(())
            })
            .await
    }

    /// Number of keys that have ever been locked.
    pub fn key_count(&self) -> usize {
        self.slots.len()
    }
}

impl Default for LocalLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Manager for LocalLockManager {
    fn name(&self) -> &'static str {
        "memory_lock_manager"
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<()> {
        LocalLockManager::lock(self, ctx, key, ttl).await
    }

    async fn try_lock(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<bool> {
        LocalLockManager::try_lock(self, ctx, key, ttl).await
    }

    async fn unlock(&self, ctx: &Context, key: &str) -> Result<()> {
        LocalLockManager::unlock(self, ctx, key).await
    }
}
