//! Cancellation and deadline propagation for send operations.
//!
//! A [`SendContext`] is passed to every blocking point (rate-limit wait, pool
//! acquire, dial, backoff sleep, transport round-trips). Each point races its
//! future against the context's cancellation token and the tighter of the
//! context deadline and its own per-operation timeout.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{codes, MailError};

/// Why a blocking operation stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    /// The context was cancelled.
    #[error("context cancelled")]
    Cancelled,
    /// The context deadline or the operation timeout elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl From<Interrupted> for MailError {
    fn from(interrupted: Interrupted) -> Self {
        let code = match interrupted {
            Interrupted::Cancelled => codes::CONTEXT_CANCELLED,
            Interrupted::DeadlineExceeded => codes::DEADLINE_EXCEEDED,
        };
        MailError::timeout(code, interrupted.to_string())
    }
}

/// Caller-supplied cancellation signal and optional deadline.
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl SendContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context bound to an existing cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Returns a copy of this context expiring after `timeout`, or earlier if
    /// this context already has a tighter deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        Self {
            token: self.token.clone(),
            deadline: Some(match self.deadline {
                Some(existing) if existing < candidate => existing,
                _ => candidate,
            }),
        }
    }

    /// Returns a child context: cancelling the parent cancels the child, but
    /// not the other way around.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and all its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once the context is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The context deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Current interruption state, if any.
    pub fn err(&self) -> Option<Interrupted> {
        if self.token.is_cancelled() {
            return Some(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupted::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    fn effective_deadline(&self, op_timeout: Option<Duration>) -> Option<Instant> {
        let op_deadline = op_timeout.map(|t| Instant::now() + t);
        match (self.deadline, op_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Runs `fut` until it completes, the context is cancelled, or the tighter
    /// of the context deadline and `op_timeout` elapses.
    pub async fn run<F, T>(&self, op_timeout: Option<Duration>, fut: F) -> Result<T, Interrupted>
    where
        F: Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let deadline = self.effective_deadline(op_timeout);
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupted::Cancelled),
            _ = sleep_until_opt(deadline) => Err(Interrupted::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Sleeps for `duration` unless interrupted first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.run(None, tokio::time::sleep(duration)).await
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = SendContext::background();
        let out = ctx.run(Some(Duration::from_secs(1)), async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_applies() {
        let ctx = SendContext::background();
        let out = ctx
            .run(Some(Duration::from_millis(50)), tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(out, Err(Interrupted::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tighter_context_deadline_wins() {
        let ctx = SendContext::background().with_timeout(Duration::from_millis(10));
        let started = Instant::now();
        let out = ctx
            .run(Some(Duration::from_secs(30)), tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(out, Err(Interrupted::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_fast() {
        let ctx = SendContext::background();
        ctx.cancel();
        let out = ctx.run(None, async { 1 }).await;
        assert_eq!(out, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = SendContext::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());

        let parent = SendContext::background();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_interrupted_maps_to_timeout_kind() {
        let err: MailError = Interrupted::Cancelled.into();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Timeout);
        assert_eq!(err.code(), codes::CONTEXT_CANCELLED);
    }
}
