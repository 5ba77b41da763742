//! Cancellation and deadline propagation for store calls
//!
//! A [`Context`] is cheap to clone and is threaded through every call that may
//! block on the database. Cancelling a context cancels all contexts derived
//! from it; a derived deadline is never later than its parent's.

use crate::error::{DbError, DbResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound for rollbacks issued while cleaning up after a failure
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

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
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Detached context for best-effort cleanup after the caller's context
    /// has already been cancelled or has expired.
    pub(crate) fn cleanup() -> Self {
        Self::background().with_timeout(CLEANUP_TIMEOUT)
    }

    /// Derive a context that can be cancelled without affecting this one
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why this context is done, or `None` while it is still live
    pub fn err(&self) -> Option<DbError> {
        if self.token.is_cancelled() {
            return Some(DbError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(DbError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Run a store call under this context.
    ///
    /// The call is not started when the context is already done. Otherwise it
    /// is dropped as soon as the context is cancelled or its deadline passes.
    pub async fn run<T, F>(&self, call: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(DbError::Cancelled),
            _ = deadline_elapsed(self.deadline) => Err(DbError::DeadlineExceeded),
            result = call => result,
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_runs_call() {
        let ctx = Context::background();
        let value = ctx.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(ctx.err().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_context_skips_call() {
        let ctx = Context::background().child();
        ctx.cancel();

        let mut started = false;
        let result = ctx
            .run(async {
                started = true;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(DbError::Cancelled)));
        assert!(!started);
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_children() {
        let parent = Context::background();
        let child = parent.child().with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_alone() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_pending_call() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let result: DbResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DbError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_derived_deadline_never_extends_parent() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
