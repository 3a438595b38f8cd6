//! Cancellation and deadlines for blocking store operations.

use crate::error::{Error, Result};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Carried by every store operation and checked between blob transfers.
///
/// Work abandoned on cancellation is never committed; a staging directory
/// that was mid-write may be left for an external cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never expires on its own.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context cancelled through the given token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Expire `timeout` from now, keeping the current token.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Token that cancels this context (and its clones).
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with `Cancelled` once the token fires or the deadline passes.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::cancelled("cancellation requested"));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::cancelled("deadline exceeded"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_done() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn test_cancel_propagates_to_clones() {
        let ctx = Context::background();
        let clone = ctx.clone();
        ctx.cancel();
        assert!(clone.is_done());
        assert!(matches!(clone.check(), Err(Error::Cancelled { .. })));
    }

    #[test]
    fn test_expired_deadline() {
        let ctx = Context::background().with_deadline(Instant::now());
        assert!(matches!(ctx.check(), Err(Error::Cancelled { .. })));
    }

    #[test]
    fn test_future_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(3600));
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn test_external_token() {
        let token = CancellationToken::new();
        let ctx = Context::with_token(token.child_token());
        token.cancel();
        assert!(ctx.is_done());
    }
}
