//! Cancellation and deadlines for blocking app calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::HostError;

/// Shared flag that aborts in-flight calls when set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every call observing this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounds a blocking call: an optional deadline plus a cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancelToken,
}

impl CallContext {
    /// A context that never expires and is never cancelled.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Sets the cancellation token observed by calls.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Derives a context that expires after `timeout`, or earlier if this
    /// context already expires sooner.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    /// The cancellation token.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Time left before the deadline, `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fails when the context is cancelled or past its deadline.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Cancelled`] or [`HostError::DeadlineExceeded`].
    pub fn check(&self) -> Result<(), HostError> {
        if self.cancel.is_cancelled() {
            return Err(HostError::Cancelled);
        }
        match self.remaining() {
            Some(left) if left.is_zero() => Err(HostError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_context_never_fails() {
        assert!(CallContext::background().check().is_ok());
        assert!(CallContext::background().remaining().is_none());
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancelToken::new();
        let ctx = CallContext::background().with_cancel(token.clone());
        let derived = ctx.with_timeout(Duration::from_secs(60));
        token.cancel();
        assert!(matches!(derived.check(), Err(HostError::Cancelled)));
    }

    #[test]
    fn shorter_parent_deadline_wins() {
        let parent = CallContext::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        let left = child.remaining().expect("bounded");
        assert!(left <= Duration::from_millis(10));
    }

    #[test]
    fn expired_deadline_fails() {
        let ctx = CallContext::background().with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(HostError::DeadlineExceeded)));
    }
}
