use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

/// Boxed future produced by a unit of work.
pub type WorkFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Opaque, zero-argument, side-effecting unit of work.
pub type Work = Box<dyn FnOnce() -> WorkFuture + Send + Sync>;

/// Callback invoked with the result of every drained execution.
pub type OutcomeFn<K> = Box<dyn Fn(&DispatchOutcome<K>) + Send + Sync>;

/// A request to run `work` for `key`, subject to throttling.
pub struct WorkSignal<K> {
    pub key: K,
    pub submitted_at: Instant,
    work: Work,
}

impl<K> WorkSignal<K> {
    /// Wraps an async closure as a work signal stamped with the current time.
    pub fn new<F, Fut>(key: K, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            key,
            submitted_at: Instant::now(),
            work: Box::new(move || Box::pin(work())),
        }
    }

    pub(crate) fn into_work(self) -> Work {
        self.work
    }
}

impl<K: fmt::Debug> fmt::Debug for WorkSignal<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkSignal")
            .field("key", &self.key)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}

/// How a drained execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    Completed,
    Failed(String),
    Panicked(String),
}

impl DispatchStatus {
    /// Metric label for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Panicked(_) => "panicked",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Structured result of one drained execution.
#[derive(Debug, Clone)]
pub struct DispatchOutcome<K> {
    pub key: K,
    pub status: DispatchStatus,
    /// Time between submission of the executed signal and the start of work.
    pub waited: Duration,
    /// Wall time spent inside the work.
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_labels() {
        assert_eq!(DispatchStatus::Completed.as_str(), "completed");
        assert_eq!(DispatchStatus::Failed("x".into()).as_str(), "failed");
        assert_eq!(DispatchStatus::Panicked("x".into()).as_str(), "panicked");
        assert!(DispatchStatus::Completed.is_success());
        assert!(!DispatchStatus::Failed("x".into()).is_success());
    }

    #[tokio::test]
    async fn test_signal_runs_wrapped_closure() {
        let signal = WorkSignal::new(7u32, || async { anyhow::bail!("boom") });
        assert_eq!(signal.key, 7);

        let err = (signal.into_work())().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
