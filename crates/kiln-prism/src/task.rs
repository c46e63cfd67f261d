//! Polling of asynchronous control-plane tasks.

use crate::api::PrismApi;
use crate::error::{PrismError, Result};
use crate::types::{TaskCompletion, TaskStatus};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Production poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default overall budget for a single task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PrismError::Cancelled),
        result = fut => result,
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn cancellable_sleep(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PrismError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Polls a task to a terminal state.
///
/// Every fetch is preceded by one poll interval, so a task that succeeds on
/// the n-th fetch returns after `n * poll_interval`. The number of fetches is
/// bounded by `max_duration / poll_interval` (at least one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskWaiter {
    poll_interval: Duration,
    max_duration: Duration,
}

impl Default for TaskWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_TASK_TIMEOUT)
    }
}

impl TaskWaiter {
    pub fn new(poll_interval: Duration, max_duration: Duration) -> Self {
        Self {
            poll_interval,
            max_duration,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Maximum number of status fetches.
    pub fn budget(&self) -> u32 {
        let n = self
            .max_duration
            .as_nanos()
            .checked_div(self.poll_interval.as_nanos())
            .unwrap_or(1);
        u32::try_from(n).unwrap_or(u32::MAX).max(1)
    }

    /// Wait for `task_id` to succeed.
    ///
    /// # Errors
    ///
    /// - [`PrismError::TaskFailed`] with the provider's error text on FAILED/CANCELED
    /// - [`PrismError::TaskTimeout`] when the fetch budget is exhausted
    /// - [`PrismError::Cancelled`] as soon as `cancel` fires
    pub async fn wait(
        &self,
        api: &dyn PrismApi,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskCompletion> {
        let budget = self.budget();
        tracing::debug!(task = %task_id, budget, "Waiting for task");

        for attempt in 1..=budget {
            cancellable_sleep(cancel, self.poll_interval).await?;
            let task = cancellable(cancel, api.get_task(task_id)).await?;

            match task.status {
                TaskStatus::Succeeded => {
                    tracing::debug!(task = %task_id, attempt, "Task succeeded");
                    return Ok(task.into());
                }
                TaskStatus::Failed | TaskStatus::Canceled => {
                    let detail = task
                        .error_detail
                        .unwrap_or_else(|| format!("task ended in state {}", task.status));
                    tracing::warn!(task = %task_id, detail = %detail, "Task failed");
                    return Err(PrismError::TaskFailed {
                        task: task_id.to_string(),
                        detail,
                    });
                }
                status => {
                    tracing::debug!(task = %task_id, %status, attempt, "Task still in progress");
                }
            }
        }

        Err(PrismError::TaskTimeout {
            task: task_id.to_string(),
            budget: self.max_duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakePrism;
    use tokio::time::Instant;

    #[test]
    fn test_budget() {
        let waiter = TaskWaiter::new(Duration::from_secs(5), Duration::from_secs(600));
        assert_eq!(waiter.budget(), 120);

        let waiter = TaskWaiter::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(waiter.budget(), 1);
    }

    #[test]
    fn test_budget_sub_millisecond_interval() {
        let waiter = TaskWaiter::new(Duration::from_micros(500), Duration::from_secs(60));
        assert_eq!(waiter.budget(), 120_000);

        let waiter = TaskWaiter::new(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(waiter.budget(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_succeeds_after_four_fetches() {
        let fake = FakePrism::new();
        fake.script_task(
            "t-1",
            vec![
                TaskStatus::Running,
                TaskStatus::Running,
                TaskStatus::Running,
                TaskStatus::Succeeded,
            ],
        );
        let waiter = TaskWaiter::new(Duration::from_secs(5), Duration::from_secs(600));
        let start = Instant::now();

        waiter
            .wait(&fake, "t-1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert_eq!(fake.task_fetches("t-1"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let fake = FakePrism::new();
        fake.script_task("t-2", vec![TaskStatus::Running]);
        let waiter = TaskWaiter::new(Duration::from_secs(5), Duration::from_secs(30));

        let err = waiter
            .wait(&fake, "t-2", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PrismError::TaskTimeout { ref task, .. } if task == "t-2"));
        assert_eq!(fake.task_fetches("t-2"), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_surfaces_failure_detail() {
        let fake = FakePrism::new();
        fake.script_task("t-3", vec![TaskStatus::Queued, TaskStatus::Failed]);
        fake.set_task_error("t-3", "disk quota exceeded");
        let waiter = TaskWaiter::default();

        let err = waiter
            .wait(&fake, "t-3", &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            PrismError::TaskFailed { detail, .. } => assert_eq!(detail, "disk quota exceeded"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.task_fetches("t-3"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled_mid_poll() {
        let fake = FakePrism::new();
        fake.script_task("t-4", vec![TaskStatus::Running]);
        let waiter = TaskWaiter::default();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = waiter.wait(&fake, "t-4", &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert_eq!(fake.task_fetches("t-4"), 1);
    }
}
