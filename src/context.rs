//! Cancellation and deadline propagation for coordination calls.
//!
//! Every limiter and lock operation takes a [`Context`]. Non-blocking
//! operations only carry it through to the store; blocking ones (`lock`)
//! race their wait against [`Context::done`] and give up as soon as the
//! context is cancelled or its deadline passes.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context finished.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// A cancellation handle with an optional deadline.
///
/// Cloning shares the underlying token, so cancelling any clone cancels all
/// of them. Use [`Context::child`] to derive a context that is cancelled
/// together with its parent but can also be cancelled on its own.
#[derive(Clone, Debug)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }
}

impl Context {
    /// A context that is never done unless explicitly cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Wrap an existing token, e.g. a service-wide shutdown token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A fresh context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().child_with_timeout(timeout)
    }

    /// Derive a child that is cancelled when `self` is.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child whose deadline is the earlier of the parent's and `timeout` from now.
    ///
    /// A `timeout` too large to represent adds no deadline of its own.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(parent), Some(candidate)) => Some(parent.min(candidate)),
            (parent, None) => parent,
            (None, candidate) => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `None` while the context is live, otherwise the reason it finished.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ContextError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_live() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert_eq!(ctx.err(), None);
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let ctx = Context::background();
        let clone = ctx.clone();

        clone.cancel();

        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn test_parent_cancel_reaches_child() {
        let parent = Context::background();
        let child = parent.child();

        parent.cancel();

        assert!(child.is_done());
    }

    #[test]
    fn test_child_cancel_leaves_parent_live() {
        let parent = Context::background();
        let child = parent.child();

        child.cancel();

        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = Context::with_timeout(Duration::from_millis(100));
        assert!(!ctx.is_done());

        let reason = ctx.done().await;

        assert_eq!(reason, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_cannot_extend_parent_deadline() {
        let parent = Context::with_timeout(Duration::from_millis(50));
        let child = parent.child_with_timeout(Duration::from_secs(10));

        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_beyond_clock_range_adds_no_deadline() {
        let ctx = Context::with_timeout(Duration::MAX);
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_done());

        let parent = Context::with_timeout(Duration::from_millis(50));
        let child = parent.child_with_timeout(Duration::MAX);
        assert_eq!(child.deadline(), parent.deadline());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(child.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_done_resolves_on_cancel() {
        let ctx = Context::background();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.done().await });

        ctx.cancel();

        assert_eq!(handle.await.unwrap(), ContextError::Cancelled);
    }
}
