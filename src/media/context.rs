//! Per-request cancellation and deadlines
//!
//! Every blocking step of an ingestion (pre-flight check, download,
//! object store write, waiting on another ingestion of the same digest)
//! runs through [`IngestContext::guard`], so a caller can abort the whole
//! request with a [`CancellationToken`] or bound it with a deadline.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a guarded operation stopped before completing
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation signal and optional deadline for one ingestion request
#[derive(Debug, Clone, Default)]
pub struct IngestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl IngestContext {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Attach a caller-owned cancellation token
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Tighten the deadline. An earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    /// The token observed by guarded operations
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel every operation running under this context
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check the context without awaiting anything
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Interrupted::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Run `fut` until it completes, the token fires, or the deadline passes.
    ///
    /// The future is dropped on interruption.
    pub async fn guard<F>(&self, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupted::Cancelled),
            _ = deadline => Err(Interrupted::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_passes_output_through() {
        let ctx = IngestContext::background();
        let value = ctx.guard(async { 42 }).await;
        assert_eq!(value, Ok(42));
    }

    #[tokio::test]
    async fn test_guard_observes_cancellation() {
        let ctx = IngestContext::background();
        ctx.cancel();
        let result = ctx.guard(async { 1 }).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_guard_cancel_while_pending() {
        let ctx = IngestContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = ctx.guard(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_guard_deadline() {
        let ctx = IngestContext::with_timeout(Duration::from_millis(10));
        let result = ctx.guard(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::DeadlineExceeded));
    }

    #[test]
    fn test_with_deadline_keeps_earliest() {
        let now = Instant::now();
        let ctx = IngestContext::with_timeout(Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(60));
        assert!(ctx.deadline().unwrap() <= now + Duration::from_secs(1));
    }

    #[test]
    fn test_shared_token() {
        let token = CancellationToken::new();
        let ctx = IngestContext::background().with_token(token.clone());
        assert!(ctx.check().is_ok());
        token.cancel();
        assert_eq!(ctx.check(), Err(Interrupted::Cancelled));
    }
}
