//! Request context carrying cancellation and deadline
//!
//! Storage operations are not interruptible once they reach the key-value
//! store; the context is checked at the boundary before any work starts.

use crate::{Result, TsError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline for a single storage call
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context from an existing cancellation token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Set a deadline `timeout` from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Token shared with whoever may cancel this request
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Fail if the request was cancelled or its deadline has passed
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(TsError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(TsError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_context_passes() {
        assert!(Context::background().check().is_ok());
    }

    #[test]
    fn test_cancelled_context_fails() {
        let ctx = Context::background();
        let child = ctx.clone();
        ctx.cancel();
        assert!(matches!(child.check(), Err(TsError::Cancelled)));
    }

    #[test]
    fn test_expired_deadline_fails() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(TsError::DeadlineExceeded)));

        let ctx = Context::background().with_timeout(Duration::from_secs(60));
        assert!(ctx.check().is_ok());
    }
}
