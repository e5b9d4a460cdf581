//! Per-run execution context handed to every step handler.
//!
//! Cancellation is advisory: the state machine checks the context between
//! steps, and a handler that wants to stop mid-step must observe it itself
//! (via [`TaskContext::cancelled`] or [`TaskContext::run_until`]).

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wise_shared::{Result, WiseError};

#[derive(Debug, Clone)]
pub struct TaskContext {
    tid: String,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl TaskContext {
    /// Context for one scheduled run: cancellable through `token` and
    /// expiring `timeout` from now.
    pub fn new(tid: impl Into<String>, token: CancellationToken, timeout: Duration) -> Self {
        Self {
            tid: tid.into(),
            token,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Context with no deadline and a fresh token, for direct `run` calls.
    pub fn detached(tid: impl Into<String>) -> Self {
        Self {
            tid: tid.into(),
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn tid(&self) -> &str {
        &self.tid
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Err(Cancelled)` or `Err(DeadlineExceeded)` once the run should stop.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(WiseError::Cancelled);
        }
        if self.is_expired() {
            return Err(WiseError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
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

    /// Drive `fut` to completion unless the context stops first.
    pub async fn run_until<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.check().err().unwrap_or(WiseError::Cancelled)),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new("t1", token.clone(), Duration::from_secs(60));
        assert!(ctx.check().is_ok());

        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(WiseError::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_expires() {
        let ctx = TaskContext::new("t1", CancellationToken::new(), Duration::from_millis(20));
        assert!(!ctx.is_expired());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ctx.is_expired());
        assert!(matches!(ctx.check(), Err(WiseError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn run_until_stops_on_cancel() {
        let ctx = TaskContext::detached("t1");
        let token = ctx.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result: Result<()> = ctx
            .run_until(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(WiseError::Cancelled)));
    }

    #[tokio::test]
    async fn run_until_passes_through_result() {
        let ctx = TaskContext::detached("t1");
        let value = ctx.run_until(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
