//! Per-task-type executors: the seam between the scheduler and a pipeline.

use std::time::Duration;

use async_trait::async_trait;
use wise_shared::{Result, Task};

use crate::context::TaskContext;
use crate::state_machine::StateMachine;

/// Default retries allowed after the first failed run.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff held by a worker after a failed run.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Binds a task type to the pipeline that runs it and its retry policy.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// The `task_type` this executor claims.
    fn task_type(&self) -> &str;

    fn max_retries(&self) -> u32;

    fn retry_interval(&self) -> Duration;

    /// Persist a new task of this type with its step chain.
    async fn create_task(&self, params: &serde_json::Value, name: &str) -> Result<Task>;

    /// Materialize the task's step chain if it does not exist yet.
    async fn create_task_plans(&self, task: &Task) -> Result<()>;

    /// Run the task from its persisted `current_state`.
    async fn execute(&self, ctx: &TaskContext, task: &Task) -> Result<()>;
}

/// A [`TaskExecutor`] backed by a [`StateMachine`].
pub struct PipelineExecutor {
    task_type: String,
    max_retries: u32,
    retry_interval: Duration,
    machine: StateMachine,
}

impl PipelineExecutor {
    pub fn new(task_type: impl Into<String>, machine: StateMachine) -> Self {
        Self {
            task_type: task_type.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            machine,
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, retry_interval: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_interval = retry_interval;
        self
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }
}

#[async_trait]
impl TaskExecutor for PipelineExecutor {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    async fn create_task(&self, params: &serde_json::Value, name: &str) -> Result<Task> {
        self.machine.create_task(params, name, &self.task_type).await
    }

    async fn create_task_plans(&self, task: &Task) -> Result<()> {
        self.machine.create_plans(task).await.map(|_| ())
    }

    async fn execute(&self, ctx: &TaskContext, task: &Task) -> Result<()> {
        self.machine
            .run(ctx, &task.tid, &task.params, &task.current_state)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{StepOutcome, handler_fn};
    use crate::test_support::test_store;
    use serde_json::json;
    use wise_shared::{StepStatus, TaskStatus};
    use wise_storage::{StepStore, TaskStore};

    async fn executor() -> PipelineExecutor {
        let mut machine = StateMachine::new(test_store().await);
        machine
            .register_state(
                "one",
                "One",
                handler_fn(|_ctx, input| async move { Ok(StepOutcome::next(input)) }),
            )
            .register_state(
                "two",
                "Two",
                handler_fn(|_ctx, _input| async { Ok(StepOutcome::next(r#"{"ok":true}"#)) }),
            );
        PipelineExecutor::new("demo", machine)
    }

    #[tokio::test]
    async fn retry_policy_defaults_and_override() {
        let exec = executor().await;
        assert_eq!(exec.task_type(), "demo");
        assert_eq!(exec.max_retries(), 3);
        assert_eq!(exec.retry_interval(), Duration::from_secs(5));

        let exec = exec.with_retry_policy(1, Duration::from_millis(10));
        assert_eq!(exec.max_retries(), 1);
        assert_eq!(exec.retry_interval(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn execute_runs_from_current_state() {
        let exec = executor().await;
        let task = exec.create_task(&json!({"n": 1}), "first").await.unwrap();
        assert_eq!(task.task_type, "demo");
        assert_eq!(task.status, TaskStatus::Init);

        exec.execute(&TaskContext::detached(&task.tid), &task)
            .await
            .unwrap();

        let store = exec.machine().store();
        let steps = store.steps_by_task(&task.tid).await.unwrap();
        assert!(steps.iter().all(|s| s.status == StepStatus::Success));
        let stored = store.get_task(&task.tid).await.unwrap().unwrap();
        assert_eq!(stored.result, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn create_task_plans_is_idempotent() {
        let exec = executor().await;
        let task = exec.create_task(&json!({}), "plans").await.unwrap();
        exec.create_task_plans(&task).await.unwrap();
        let steps = exec.machine().store().steps_by_task(&task.tid).await.unwrap();
        assert_eq!(steps.len(), 2);
    }
}
