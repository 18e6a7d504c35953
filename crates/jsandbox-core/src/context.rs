//! Cancellation scopes for blocking pool and worker operations
//!
//! A [`Context`] pairs a [`CancellationToken`] with an optional deadline.
//! Derived contexts are cancelled with their parent and never outlive its
//! deadline; cancelling a derived context leaves the parent untouched.

use std::future;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Why a context ended.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that never ends on its own.
    #[must_use]
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a context that ends after `timeout` at the latest.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that ends at `deadline` at the latest.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check; `None` while the context is still live.
    #[must_use]
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            Some(ContextError::Canceled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        if let Some(reason) = self.err() {
            return reason;
        }
        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            () = self.token.cancelled() => ContextError::Canceled,
            () = expiry => ContextError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_deadline_is_reported_immediately() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn cancelling_parent_ends_children() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert_eq!(child.done().await, ContextError::Canceled);
    }

    #[tokio::test]
    async fn cancelling_child_leaves_parent_live() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        child.cancel();
        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert_eq!(parent.err(), None);
    }

    #[test]
    fn derived_deadline_never_extends_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn deadline_fires_while_waiting() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
    }
}
