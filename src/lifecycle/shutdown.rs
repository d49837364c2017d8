//! Shutdown coordination: the deadline-bearing context handed to servers and
//! hooks, and the aggregate error reported when a shutdown goes wrong.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::hooks::HookError;

/// Why a [`ShutdownContext`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// A cancellation scope with an optional deadline.
///
/// Cloning is cheap and clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct ShutdownContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ShutdownContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context cancelled together with `token`, without a deadline.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derive a child context that expires `timeout` from now, or earlier if
    /// this context already has a closer deadline.
    pub fn timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Apply `timeout` only when this context has no deadline yet.
    pub fn or_timeout(&self, timeout: Duration) -> Self {
        match self.deadline {
            Some(_) => self.clone(),
            None => self.timeout(timeout),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// `None` while the context is live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

/// A server that was still serving connections when the shutdown context ended.
#[derive(Debug, Clone, Error)]
#[error("server {address} did not drain: {cause} ({open_connections} connection(s) force-closed)")]
pub struct DrainError {
    pub address: String,
    pub open_connections: u64,
    pub cause: ContextError,
}

/// Everything that failed during one shutdown.
///
/// Every phase runs to completion; failures are collected here instead of
/// stopping the sequence.
#[derive(Debug, Default)]
pub struct ShutdownError {
    pub before: Vec<HookError>,
    pub drain: Vec<DrainError>,
    pub after: Vec<HookError>,
}

impl ShutdownError {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.drain.is_empty() && self.after.is_empty()
    }

    /// The drain failure observed last, the only one a single-error report keeps.
    pub fn last_drain_error(&self) -> Option<&DrainError> {
        self.drain.last()
    }

    pub fn hook_errors(&self) -> impl Iterator<Item = &HookError> {
        self.before.iter().chain(self.after.iter())
    }

    pub(crate) fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shutdown failed: ")?;
        let messages = self
            .before
            .iter()
            .map(ToString::to_string)
            .chain(self.drain.iter().map(ToString::to_string))
            .chain(self.after.iter().map(ToString::to_string));
        for (i, message) in messages.enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::hooks::Phase;

    #[tokio::test]
    async fn test_background_never_done() {
        let ctx = ShutdownContext::background();
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_done());

        let waited = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let ctx = ShutdownContext::with_timeout(Duration::from_millis(10));
        assert!(ctx.err().is_none());

        ctx.done().await;
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_cancel_wins() {
        let token = CancellationToken::new();
        let ctx = ShutdownContext::from_token(token.clone());
        token.cancel();

        ctx.done().await;
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_timeout_keeps_closer_deadline() {
        let parent = ShutdownContext::with_timeout(Duration::from_secs(1));
        let child = parent.timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let kept = parent.or_timeout(Duration::from_millis(1));
        assert_eq!(kept.deadline(), parent.deadline());

        let applied = ShutdownContext::background().or_timeout(Duration::from_secs(5));
        assert!(applied.deadline().is_some());
    }

    #[test]
    fn test_child_cancelled_by_parent() {
        let parent = ShutdownContext::background();
        let child = parent.timeout(Duration::from_secs(60));
        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_shutdown_error_display() {
        let mut err = ShutdownError::default();
        assert!(err.is_empty());

        err.before.push(HookError::new(Phase::BeforeShutdown, "drain-lb", "lb unreachable"));
        err.drain.push(DrainError {
            address: "127.0.0.1:8080".into(),
            open_connections: 2,
            cause: ContextError::DeadlineExceeded,
        });

        let message = err.to_string();
        assert!(message.contains("drain-lb"));
        assert!(message.contains("127.0.0.1:8080"));
        assert_eq!(err.last_drain_error().map(|e| e.open_connections), Some(2));
        assert_eq!(err.hook_errors().count(), 1);
    }
}
