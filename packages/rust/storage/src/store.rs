//! Persistence interfaces consumed by the state machine and the scheduler.
//!
//! All operations are request/response and keyed by row id or by the
//! task/step identifiers; implementations must be safe for concurrent use.

use async_trait::async_trait;
use wise_shared::{Result, Step, Task, TaskPage, TaskQuery, TaskStatus};

/// Persistence for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task. Returns the new row id.
    async fn create_task(&self, task: &Task) -> Result<i64>;

    /// Overwrite every mutable field of the task identified by `task.tid`.
    async fn update_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, tid: &str) -> Result<Option<Task>>;

    async fn get_task_by_id(&self, id: i64) -> Result<Option<Task>>;

    /// Up to `limit` tasks in `status`, oldest first.
    async fn tasks_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>>;

    /// Filtered, paged listing, newest first.
    async fn list_tasks(&self, query: &TaskQuery) -> Result<TaskPage>;

    /// Unconditionally set status and error. Fails with `TaskNotFound` for unknown ids.
    async fn update_status(&self, tid: &str, status: TaskStatus, error: &str) -> Result<()>;

    /// Record the step most recently completed and its output.
    async fn update_progress(&self, tid: &str, state: &str, step: u32, result: &str)
    -> Result<()>;

    /// Move the task from `from` to `to` only if it is still in `from`.
    ///
    /// Returns `false` when another writer got there first. `error`, when
    /// given, replaces the stored error message.
    async fn transition_status(
        &self,
        tid: &str,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool>;

    /// Mark a running task as `retry` with the given attempt count and error.
    /// Returns `false` if the task is no longer running.
    async fn record_retry(&self, tid: &str, retry_count: u32, error: &str) -> Result<bool>;

    /// Put a task in `from` back to `init` with a cleared retry count and error.
    async fn reset_for_retry(&self, tid: &str, from: TaskStatus) -> Result<bool>;

    /// Move every `running` task to `retry`. Returns the number of tasks moved.
    async fn recover_running(&self) -> Result<u64>;

    /// Delete a task and its steps. Returns `false` if it did not exist.
    async fn delete_task(&self, tid: &str) -> Result<bool>;
}

/// Persistence for ordered step records.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Insert a batch of steps in chain order.
    async fn create_steps(&self, steps: &[Step]) -> Result<()>;

    /// Overwrite the mutable fields of the step identified by `step.pid`.
    async fn update_step(&self, step: &Step) -> Result<()>;

    /// Every step of a task, ordered by index.
    async fn steps_by_task(&self, tid: &str) -> Result<Vec<Step>>;

    async fn get_step(&self, pid: &str) -> Result<Option<Step>>;

    async fn get_step_by_id(&self, id: i64) -> Result<Option<Step>>;
}

/// A store that persists both tasks and their steps.
pub trait PipelineStore: TaskStore + StepStore {}

impl<T: TaskStore + StepStore + ?Sized> PipelineStore for T {}
