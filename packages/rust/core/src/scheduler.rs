//! Polling, pool-bounded task scheduler.
//!
//! The task table is the queue: every tick polls up to `pool_size` eligible
//! tasks (`init` first, otherwise `retry`), claims each one with a
//! conditional `→ running` update and hands it to a worker holding one
//! semaphore permit. A full pool defers the remaining candidates to the next
//! tick. Failed runs are retried up to the executor's policy; the worker
//! keeps its permit while it sleeps out the retry interval.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use wise_shared::{
    Result, SchedulerConfig, Task, TaskDetail, TaskPage, TaskQuery, TaskStatus, WiseError,
};
use wise_storage::PipelineStore;

use crate::context::TaskContext;
use crate::executor::TaskExecutor;

/// Error message recorded on a task cancelled through [`TaskScheduler::cancel_task`].
const CANCELLED_MESSAGE: &str = "cancelled by request";

/// Cheaply clonable handle to a running scheduler.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn PipelineStore>,
    config: SchedulerConfig,
    executors: DashMap<String, Arc<dyn TaskExecutor>>,
    pool: Arc<Semaphore>,
    /// Cancellation handles of tasks owned by a worker of this process.
    running: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn PipelineStore>, config: SchedulerConfig) -> Self {
        let permits = config.pool_size.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                pool: Arc::new(Semaphore::new(permits)),
                config,
                executors: DashMap::new(),
                running: DashMap::new(),
                shutdown: CancellationToken::new(),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Register `executor` for its task type, replacing any previous one.
    pub fn register(&self, executor: Arc<dyn TaskExecutor>) {
        let task_type = executor.task_type().to_string();
        if self
            .inner
            .executors
            .insert(task_type.clone(), executor)
            .is_some()
        {
            warn!(%task_type, "executor replaced");
        }
    }

    fn executor(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.inner
            .executors
            .get(task_type)
            .map(|entry| entry.value().clone())
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.inner.store
    }

    /// Workers currently holding a pool slot.
    pub fn active_workers(&self) -> usize {
        self.pool_size() - self.inner.pool.available_permits()
    }

    fn pool_size(&self) -> usize {
        self.inner.config.pool_size.max(1)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Recover orphaned tasks and start the background tick loop.
    pub async fn start(&self) -> Result<()> {
        let recovered = self.inner.store.recover_running().await?;
        if recovered > 0 {
            warn!(recovered, "moved orphaned running tasks back to retry");
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.config.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.tick().await {
                            error!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
            debug!("tick loop stopped");
        });

        if let Ok(mut slot) = self.inner.ticker.lock() {
            *slot = Some(handle);
        }
        info!(
            pool_size = self.pool_size(),
            scan_interval_secs = self.inner.config.scan_interval.as_secs(),
            "scheduler started"
        );
        Ok(())
    }

    /// Stop ticking and wait for every in-flight worker to release its slot.
    ///
    /// Running tasks are not cancelled; they finish normally.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let handle = self.inner.ticker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "tick loop ended abnormally");
            }
        }

        match self.inner.pool.acquire_many(self.pool_size() as u32).await {
            Ok(_all) => info!("scheduler stopped"),
            Err(e) => warn!(error = %e, "worker pool closed while stopping"),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Poll for eligible tasks and dispatch as many as the pool allows.
    ///
    /// Returns the number of tasks handed to workers. Store errors abort the
    /// tick without touching any task.
    pub async fn tick(&self) -> Result<usize> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(0);
        }

        let limit = self.pool_size();
        let mut candidates = self
            .inner
            .store
            .tasks_by_status(TaskStatus::Init, limit)
            .await?;
        if candidates.is_empty() {
            candidates = self
                .inner
                .store
                .tasks_by_status(TaskStatus::Retry, limit)
                .await?;
        }

        let mut dispatched = 0;
        for task in candidates {
            // A worker here still owns it (e.g. sleeping out its retry interval).
            if self.inner.running.contains_key(&task.tid) {
                continue;
            }

            let Ok(permit) = self.inner.pool.clone().try_acquire_owned() else {
                debug!("worker pool full, deferring to next tick");
                break;
            };

            // Visible to `cancel_task` before the claim lands.
            let token = CancellationToken::new();
            self.inner.running.insert(task.tid.clone(), token.clone());

            let claimed = self
                .inner
                .store
                .transition_status(&task.tid, task.status, TaskStatus::Running, None)
                .await;
            match claimed {
                Ok(true) => {}
                Ok(false) => {
                    debug!(tid = %task.tid, "task claimed elsewhere");
                    self.inner.running.remove(&task.tid);
                    continue;
                }
                Err(e) => {
                    warn!(tid = %task.tid, error = %e, "failed to claim task");
                    self.inner.running.remove(&task.tid);
                    continue;
                }
            }

            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.run_worker(task, token).await;
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(dispatched, "tick dispatched tasks");
        }
        Ok(dispatched)
    }

    #[instrument(skip_all, fields(tid = %task.tid, task_type = %task.task_type))]
    async fn run_worker(&self, task: Task, token: CancellationToken) {
        let ctx = TaskContext::new(&task.tid, token.clone(), self.inner.config.task_timeout);
        let executor = self.executor(&task.task_type);

        info!(state = %task.current_state, retry_count = task.retry_count, "task started");
        let result = match &executor {
            Some(executor) => executor.execute(&ctx, &task).await,
            None => Err(WiseError::ExecutorNotFound(task.task_type.clone())),
        };

        self.finish(&task, executor.as_deref(), &token, result).await;
        self.inner.running.remove(&task.tid);
    }

    /// Apply the success / retry / failure policy to a finished run.
    async fn finish(
        &self,
        task: &Task,
        executor: Option<&dyn TaskExecutor>,
        token: &CancellationToken,
        result: Result<()>,
    ) {
        let store = &self.inner.store;
        let tid = task.tid.as_str();

        let e = match result {
            Ok(()) => {
                match store
                    .transition_status(tid, TaskStatus::Running, TaskStatus::Success, Some(""))
                    .await
                {
                    Ok(true) => info!("task succeeded"),
                    Ok(false) => info!("task finished after its status changed, keeping it"),
                    Err(e) => error!(error = %e, "failed to record success"),
                }
                return;
            }
            Err(e) if e.is_cancelled() => {
                info!("task run stopped by cancellation");
                return;
            }
            Err(e) => e,
        };

        let message = e.to_string();
        let max_retries = executor.map_or(0, |x| x.max_retries());

        let retry_count = match disposition(&e, task.retry_count, max_retries) {
            Disposition::Fail => {
                match store
                    .transition_status(tid, TaskStatus::Running, TaskStatus::Failed, Some(&message))
                    .await
                {
                    Ok(true) => {
                        error!(error = %message, retry_count = task.retry_count, "task failed")
                    }
                    Ok(false) => debug!("task status changed during run, not marking failed"),
                    Err(store_err) => error!(error = %store_err, "failed to record failure"),
                }
                return;
            }
            Disposition::Requeue => {
                match store.record_retry(tid, task.retry_count, &message).await {
                    Ok(true) => warn!(error = %message, "storage error during run, requeued"),
                    Ok(false) => debug!("task status changed during run, not requeueing"),
                    Err(store_err) => error!(error = %store_err, "failed to requeue task"),
                }
                return;
            }
            Disposition::Retry(retry_count) => retry_count,
        };

        match store.record_retry(tid, retry_count, &message).await {
            Ok(true) => warn!(error = %message, retry_count, "task will be retried"),
            Ok(false) => {
                debug!("task status changed during run, not scheduling retry");
                return;
            }
            Err(store_err) => {
                error!(error = %store_err, "failed to record retry");
                return;
            }
        }

        // Throttle re-entry: the slot stays taken until the interval passes.
        if let Some(interval) = executor.map(|x| x.retry_interval()) {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.inner.shutdown.cancelled() => {}
                _ = token.cancelled() => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Submission & administration
    // -----------------------------------------------------------------------

    /// Create a task of `task_type` with its step chain; the next tick picks it up.
    pub async fn submit(
        &self,
        task_type: &str,
        params: &serde_json::Value,
        name: &str,
    ) -> Result<Task> {
        let executor = self
            .executor(task_type)
            .ok_or_else(|| WiseError::ExecutorNotFound(task_type.to_string()))?;
        executor.create_task(params, name).await
    }

    /// Signal the task's worker (if any) and mark the task `cancelled`.
    ///
    /// The status write is unconditional. A step that ignores its context
    /// runs to completion, but the run stops before the next step and the
    /// task keeps its `cancelled` status. Works from a process that does not
    /// own the worker.
    pub async fn cancel_task(&self, tid: &str) -> Result<()> {
        if let Some(token) = self.inner.running.get(tid) {
            token.cancel();
            debug!(%tid, "cancellation signalled to worker");
        }
        self.inner
            .store
            .update_status(tid, TaskStatus::Cancelled, CANCELLED_MESSAGE)
            .await?;
        info!(%tid, "task cancelled");
        Ok(())
    }

    /// Put a `failed` task back to `init` with a fresh retry budget.
    /// It resumes from its persisted `current_state`.
    pub async fn retry_task(&self, tid: &str) -> Result<()> {
        if self
            .inner
            .store
            .reset_for_retry(tid, TaskStatus::Failed)
            .await?
        {
            info!(%tid, "task re-queued");
            return Ok(());
        }
        Err(self.invalid_transition(tid, "retry").await)
    }

    /// Put a `cancelled` task back to `init`.
    pub async fn resume_task(&self, tid: &str) -> Result<()> {
        if self
            .inner
            .store
            .transition_status(tid, TaskStatus::Cancelled, TaskStatus::Init, Some(""))
            .await?
        {
            info!(%tid, "task resumed");
            return Ok(());
        }
        Err(self.invalid_transition(tid, "resume").await)
    }

    async fn invalid_transition(&self, tid: &str, action: &str) -> WiseError {
        match self.inner.store.get_task(tid).await {
            Ok(Some(task)) => WiseError::InvalidTransition {
                tid: tid.to_string(),
                action: action.to_string(),
                status: task.status.to_string(),
            },
            Ok(None) => WiseError::TaskNotFound(tid.to_string()),
            Err(e) => e,
        }
    }

    pub async fn get_task(&self, tid: &str) -> Result<Task> {
        self.inner
            .store
            .get_task(tid)
            .await?
            .ok_or_else(|| WiseError::TaskNotFound(tid.to_string()))
    }

    /// The task plus its full ordered step chain.
    pub async fn task_detail(&self, tid: &str) -> Result<TaskDetail> {
        let task = self.get_task(tid).await?;
        let steps = self.inner.store.steps_by_task(tid).await?;
        Ok(TaskDetail { task, steps })
    }

    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<TaskPage> {
        self.inner.store.list_tasks(query).await
    }
}

/// What a failed run does to its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Terminal `failed`.
    Fail,
    /// Back to `retry` with the new count, after the retry interval.
    Retry(u32),
    /// Back to `retry` without spending the retry budget.
    Requeue,
}

/// Fatal errors fail at once and store errors never count against the
/// budget. Anything else retries while `retry_count < max_retries`.
fn disposition(e: &WiseError, retry_count: u32, max_retries: u32) -> Disposition {
    if e.is_fatal() {
        Disposition::Fail
    } else if matches!(e, WiseError::Storage(_)) {
        Disposition::Requeue
    } else if retry_count >= max_retries {
        Disposition::Fail
    } else {
        Disposition::Retry(retry_count + 1)
    }
}
