//! Generic engine driving one task through its persisted step chain.
//!
//! States are registered in order; that order is the canonical chain used
//! when a task's steps are materialized. A run starts at the task's
//! `current_state` and persists every step transition (one step update plus
//! one task update) before the next step begins, so a crashed or failed run
//! resumes exactly after its last completed step.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use wise_shared::{EMPTY_JSON, Result, Step, StepStatus, Task, TaskStatus, WiseError, new_id};
use wise_storage::PipelineStore;

use crate::context::TaskContext;

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// Where the run goes after a successful step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The following step in chain order (ends the run after the last step).
    Next,
    /// Jump to the step with this state code.
    Goto(String),
    /// End the run cleanly.
    Done,
}

/// Output of a successful step plus the transition to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub output: String,
    pub transition: Transition,
}

impl StepOutcome {
    pub fn next(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            transition: Transition::Next,
        }
    }

    pub fn goto(output: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            transition: Transition::Goto(code.into()),
        }
    }

    pub fn done(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            transition: Transition::Done,
        }
    }

    /// Serialize `value` as the step output and continue in chain order.
    pub fn next_json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::next(serde_json::to_string(value)?))
    }

    /// Serialize `value` as the step output and end the run.
    pub fn done_json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::done(serde_json::to_string(value)?))
    }
}

/// One state's transition logic: `(context, input) -> (output, transition)`.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext, input: &str) -> Result<StepOutcome>;
}

/// Adapts an async closure into a [`StepHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a step handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutcome>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(TaskContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutcome>> + Send,
{
    async fn handle(&self, ctx: &TaskContext, input: &str) -> Result<StepOutcome> {
        (self.0)(ctx.clone(), input.to_string()).await
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Code and display name of a registered state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInfo {
    pub code: String,
    pub name: String,
}

pub struct StateMachine {
    store: Arc<dyn PipelineStore>,
    states: Vec<StateInfo>,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self {
            store,
            states: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` under `code`. Registration order is chain order;
    /// registering an existing code replaces its handler in place.
    pub fn register_state(
        &mut self,
        code: impl Into<String>,
        name: impl Into<String>,
        handler: impl StepHandler + 'static,
    ) -> &mut Self {
        let code = code.into();
        let name = name.into();
        match self.states.iter_mut().find(|s| s.code == code) {
            Some(existing) => {
                warn!(state = %code, "state registered twice, replacing handler");
                existing.name = name;
            }
            None => self.states.push(StateInfo {
                code: code.clone(),
                name,
            }),
        }
        self.handlers.insert(code, Arc::new(handler));
        self
    }

    /// Registered states in chain order.
    pub fn states(&self) -> &[StateInfo] {
        &self.states
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    /// Build one linked step per registered state for `tid`, each fed `params`.
    pub fn build_plans(&self, tid: &str, params: &str) -> Vec<Step> {
        let now = Utc::now();
        let pids: Vec<String> = self.states.iter().map(|_| new_id()).collect();

        self.states
            .iter()
            .enumerate()
            .map(|(i, state)| Step {
                id: 0,
                tid: tid.to_string(),
                pid: pids[i].clone(),
                before_pid: i.checked_sub(1).map(|p| pids[p].clone()),
                next_pid: pids.get(i + 1).cloned(),
                code: state.code.clone(),
                name: state.name.clone(),
                index: i as u32 + 1,
                status: StepStatus::Init,
                params: params.to_string(),
                result: EMPTY_JSON.to_string(),
                duration_ms: 0,
                error: String::new(),
                created_at: now,
                updated_at: now,
            })
            .collect()
    }

    /// Persist a new task and its full step chain.
    ///
    /// Steps are written before the task row so a polling scheduler never
    /// observes a task without its chain.
    pub async fn create_task(
        &self,
        params: &impl Serialize,
        name: &str,
        task_type: &str,
    ) -> Result<Task> {
        let tid = new_id();
        let first = self
            .states
            .first()
            .ok_or_else(|| WiseError::EmptyPlan { tid: tid.clone() })?;

        let params = serde_json::to_string(params)?;
        let now = Utc::now();
        let mut task = Task {
            id: 0,
            tid: tid.clone(),
            name: name.to_string(),
            task_type: task_type.to_string(),
            status: TaskStatus::Init,
            current_state: first.code.clone(),
            total_steps: self.states.len() as u32,
            current_step: 1,
            retry_count: 0,
            params: params.clone(),
            result: EMPTY_JSON.to_string(),
            error: String::new(),
            extend: EMPTY_JSON.to_string(),
            created_at: now,
            updated_at: now,
        };

        let steps = self.build_plans(&tid, &params);
        self.store.create_steps(&steps).await?;
        task.id = self.store.create_task(&task).await?;

        info!(%tid, task_type, total_steps = task.total_steps, "task created");
        Ok(task)
    }

    /// Materialize the step chain for an existing task unless it already has one.
    pub async fn create_plans(&self, task: &Task) -> Result<Vec<Step>> {
        let existing = self.store.steps_by_task(&task.tid).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        if self.states.is_empty() {
            return Err(WiseError::EmptyPlan {
                tid: task.tid.clone(),
            });
        }
        let steps = self.build_plans(&task.tid, &task.params);
        self.store.create_steps(&steps).await?;
        debug!(tid = %task.tid, count = steps.len(), "plans created");
        Ok(steps)
    }

    fn handler(&self, code: &str) -> Result<Arc<dyn StepHandler>> {
        self.handlers
            .get(code)
            .cloned()
            .ok_or_else(|| WiseError::UnknownState(code.to_string()))
    }

    /// Drive `tid` through its chain starting at `start_state`.
    ///
    /// The step's input is the output of the step that ran just before it
    /// in this run, or else its chain predecessor's persisted result, or
    /// else `params` for the first step. If `start_state` already succeeded,
    /// the run continues with the following step.
    #[instrument(skip_all, fields(tid = %tid, start = %start_state))]
    pub async fn run(
        &self,
        ctx: &TaskContext,
        tid: &str,
        params: &str,
        start_state: &str,
    ) -> Result<()> {
        self.handler(start_state)?;

        let mut steps = self.store.steps_by_task(tid).await?;
        if steps.is_empty() {
            return Err(WiseError::EmptyPlan {
                tid: tid.to_string(),
            });
        }
        self.validate_chain(tid, &steps)?;

        let mut idx = position(tid, &steps, start_state)?;
        let mut carried: Option<String> = None;

        if steps[idx].status == StepStatus::Success {
            if idx + 1 >= steps.len() {
                debug!("chain already complete");
                return Ok(());
            }
            debug!(state = %steps[idx].code, "resuming after completed step");
            carried = Some(steps[idx].result.clone());
            idx += 1;
        }

        loop {
            ctx.check()?;
            self.ensure_active(tid).await?;

            let handler = self.handler(&steps[idx].code)?;
            let input = match carried.take() {
                Some(output) => output,
                None if idx > 0 => steps[idx - 1].result.clone(),
                None => params.to_string(),
            };

            let step = &mut steps[idx];
            step.status = StepStatus::Running;
            step.params = input.clone();
            step.error.clear();
            self.store.update_step(step).await?;

            debug!(state = %step.code, step = step.index, "step started");
            let started = Instant::now();
            let outcome = handler.handle(ctx, &input).await;
            step.duration_ms = started.elapsed().as_millis() as u64;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    step.status = if e.is_cancelled() {
                        StepStatus::Cancelled
                    } else {
                        StepStatus::Failed
                    };
                    step.error = e.to_string();
                    self.store.update_step(step).await?;
                    warn!(
                        state = %step.code,
                        step = step.index,
                        elapsed_ms = step.duration_ms,
                        error = %e,
                        "step failed"
                    );
                    return Err(wrap_step_error(&step.code, e));
                }
            };

            step.status = StepStatus::Success;
            step.result = outcome.output;
            self.store.update_step(step).await?;
            self.store
                .update_progress(tid, &step.code, step.index, &step.result)
                .await?;

            info!(
                state = %step.code,
                step = step.index,
                elapsed_ms = step.duration_ms,
                "step completed"
            );

            let next = match outcome.transition {
                Transition::Done => None,
                Transition::Next => (idx + 1 < steps.len()).then_some(idx + 1),
                Transition::Goto(code) => {
                    self.handler(&code)?;
                    Some(position(tid, &steps, &code)?)
                }
            };

            match next {
                Some(n) => {
                    carried = Some(steps[idx].result.clone());
                    idx = n;
                }
                None => {
                    debug!("run finished");
                    return Ok(());
                }
            }
        }
    }

    /// A task that reached a terminal status elsewhere (e.g. cancelled from
    /// another process) stops before its next step.
    async fn ensure_active(&self, tid: &str) -> Result<()> {
        match self.store.get_task(tid).await? {
            Some(task) if task.status.is_terminal() => {
                debug!(status = %task.status, "task no longer active, stopping");
                Err(WiseError::Cancelled)
            }
            _ => Ok(()),
        }
    }

    /// Every chain step must have a handler and every registered state a step.
    fn validate_chain(&self, tid: &str, steps: &[Step]) -> Result<()> {
        if let Some(step) = steps.iter().find(|s| !self.handlers.contains_key(&s.code)) {
            return Err(WiseError::UnknownState(step.code.clone()));
        }
        if let Some(state) = self
            .states
            .iter()
            .find(|state| !steps.iter().any(|s| s.code == state.code))
        {
            return Err(WiseError::MissingStep {
                tid: tid.to_string(),
                state: state.code.clone(),
            });
        }
        Ok(())
    }
}

fn position(tid: &str, steps: &[Step], code: &str) -> Result<usize> {
    steps
        .iter()
        .position(|s| s.code == code)
        .ok_or_else(|| WiseError::MissingStep {
            tid: tid.to_string(),
            state: code.to_string(),
        })
}

/// Keep errors the scheduler classifies itself; wrap the rest as a step failure.
fn wrap_step_error(state: &str, e: WiseError) -> WiseError {
    if e.is_fatal()
        || matches!(
            e,
            WiseError::Cancelled | WiseError::DeadlineExceeded | WiseError::StepExecution { .. }
        )
    {
        e
    } else {
        WiseError::step(state, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test_support::test_store;
    use serde_json::json;
    use wise_storage::{StepStore, TaskStore};

    /// Appends `code` to the input list and counts invocations.
    struct Recorder {
        code: &'static str,
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StepHandler for Recorder {
        async fn handle(&self, _ctx: &TaskContext, input: &str) -> Result<StepOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(input.to_string());
            let mut value: serde_json::Value = serde_json::from_str(input)?;
            let trail = value["trail"].as_str().unwrap_or("").to_string();
            value["trail"] = json!(format!("{trail}{}", self.code));
            StepOutcome::next_json(&value)
        }
    }

    struct Fixture {
        machine: StateMachine,
        calls: Vec<Arc<AtomicUsize>>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    async fn fixture(codes: &[&'static str]) -> Fixture {
        let store = test_store().await;
        let mut machine = StateMachine::new(store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut calls = Vec::new();
        for &code in codes {
            let counter = Arc::new(AtomicUsize::new(0));
            machine.register_state(
                code,
                code.to_uppercase(),
                Recorder {
                    code,
                    calls: counter.clone(),
                    seen: seen.clone(),
                },
            );
            calls.push(counter);
        }
        Fixture {
            machine,
            calls,
            seen,
        }
    }

    #[tokio::test]
    async fn create_task_materializes_chain() {
        let fx = fixture(&["a", "b", "c"]).await;
        let task = fx
            .machine
            .create_task(&json!({"url": "https://example.com"}), "demo", "test")
            .await
            .unwrap();

        assert!(task.id > 0);
        assert_eq!(task.status, TaskStatus::Init);
        assert_eq!(task.current_state, "a");
        assert_eq!(task.current_step, 1);
        assert_eq!(task.total_steps, 3);

        let store = fx.machine.store();
        let steps = store.steps_by_task(&task.tid).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].before_pid.as_deref(), Some(steps[0].pid.as_str()));
        assert_eq!(steps[1].next_pid.as_deref(), Some(steps[2].pid.as_str()));
        assert!(steps.iter().all(|s| s.params == task.params));

        // Already materialized: no duplicates.
        let again = fx.machine.create_plans(&task).await.unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(store.steps_by_task(&task.tid).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn run_executes_chain_and_feeds_outputs() {
        let fx = fixture(&["a", "b", "c"]).await;
        let task = fx.machine.create_task(&json!({}), "demo", "test").await.unwrap();

        fx.machine
            .run(&TaskContext::detached(&task.tid), &task.tid, &task.params, "a")
            .await
            .unwrap();

        let store = fx.machine.store();
        let steps = store.steps_by_task(&task.tid).await.unwrap();
        assert!(steps.iter().all(|s| s.status == StepStatus::Success));
        assert_eq!(steps[2].result, r#"{"trail":"abc"}"#);
        assert_eq!(steps[1].params, r#"{"trail":"a"}"#);

        let stored = store.get_task(&task.tid).await.unwrap().unwrap();
        assert_eq!(stored.current_state, "c");
        assert_eq!(stored.current_step, 3);
        assert_eq!(stored.result, r#"{"trail":"abc"}"#);
        assert_eq!(stored.total_steps, 3);
    }

    #[tokio::test]
    async fn resume_skips_completed_steps() {
        let fx = fixture(&["a", "b", "c"]).await;
        let task = fx.machine.create_task(&json!({}), "demo", "test").await.unwrap();
        let ctx = TaskContext::detached(&task.tid);

        fx.machine.run(&ctx, &task.tid, &task.params, "a").await.unwrap();
        let stored = fx.machine.store().get_task(&task.tid).await.unwrap().unwrap();

        // Running again from the persisted state re-executes nothing.
        fx.machine
            .run(&ctx, &task.tid, &task.params, &stored.current_state)
            .await
            .unwrap();
        assert!(fx.calls.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test]
    async fn resume_mid_chain_uses_persisted_result() {
        let store = test_store().await;
        let mut machine = StateMachine::new(store.clone());
        let fail_b = Arc::new(AtomicUsize::new(1));
        let b_calls = Arc::new(AtomicUsize::new(0));

        machine.register_state(
            "a",
            "A",
            handler_fn(|_ctx, _input| async { Ok(StepOutcome::next(r#"{"from":"a"}"#)) }),
        );
        let (fail, calls) = (fail_b.clone(), b_calls.clone());
        machine.register_state(
            "b",
            "B",
            handler_fn(move |_ctx, input| {
                let fail = fail.clone();
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if fail.fetch_sub(1, Ordering::SeqCst) > 0 {
                        return Err(WiseError::Network("flaky".into()));
                    }
                    Ok(StepOutcome::done(input))
                }
            }),
        );

        let task = machine.create_task(&json!({}), "demo", "test").await.unwrap();
        let ctx = TaskContext::detached(&task.tid);

        let err = machine.run(&ctx, &task.tid, &task.params, "a").await.unwrap_err();
        assert!(matches!(err, WiseError::StepExecution { ref state, .. } if state == "b"));

        let steps = store.steps_by_task(&task.tid).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Success);
        assert_eq!(steps[1].status, StepStatus::Failed);
        assert!(steps[1].error.contains("flaky"));

        let stored = store.get_task(&task.tid).await.unwrap().unwrap();
        assert_eq!(stored.current_state, "a");

        machine
            .run(&ctx, &task.tid, &task.params, &stored.current_state)
            .await
            .unwrap();
        let steps = store.steps_by_task(&task.tid).await.unwrap();
        assert_eq!(steps[1].status, StepStatus::Success);
        assert_eq!(steps[1].result, r#"{"from":"a"}"#);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn goto_and_done_transitions() {
        let store = test_store().await;
        let mut machine = StateMachine::new(store.clone());
        machine.register_state(
            "a",
            "A",
            handler_fn(|_ctx, _input| async { Ok(StepOutcome::goto("{}", "c")) }),
        );
        machine.register_state(
            "b",
            "B",
            handler_fn(|_ctx, _input| async { Ok(StepOutcome::next("{}")) }),
        );
        machine.register_state(
            "c",
            "C",
            handler_fn(|_ctx, _input| async { Ok(StepOutcome::done(r#"{"end":true}"#)) }),
        );

        let task = machine.create_task(&json!({}), "demo", "test").await.unwrap();
        machine
            .run(&TaskContext::detached(&task.tid), &task.tid, &task.params, "a")
            .await
            .unwrap();

        let steps = store.steps_by_task(&task.tid).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Success);
        assert_eq!(steps[1].status, StepStatus::Init);
        assert_eq!(steps[2].status, StepStatus::Success);
        assert_eq!(steps[2].params, "{}");
    }

    #[tokio::test]
    async fn unknown_start_state_is_fatal() {
        let fx = fixture(&["a"]).await;
        let task = fx.machine.create_task(&json!({}), "demo", "test").await.unwrap();
        let err = fx
            .machine
            .run(&TaskContext::detached(&task.tid), &task.tid, &task.params, "zzz")
            .await
            .unwrap_err();
        assert!(matches!(err, WiseError::UnknownState(ref s) if s == "zzz"));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn missing_chain_is_empty_plan() {
        let fx = fixture(&["a"]).await;
        let err = fx
            .machine
            .run(&TaskContext::detached("ghost"), "ghost", "{}", "a")
            .await
            .unwrap_err();
        assert!(matches!(err, WiseError::EmptyPlan { .. }));
    }

    #[tokio::test]
    async fn registered_state_absent_from_chain_is_missing_step() {
        let mut fx = fixture(&["a", "b"]).await;
        let task = fx.machine.create_task(&json!({}), "demo", "test").await.unwrap();

        // A state added after the chain was materialized.
        fx.machine.register_state(
            "c",
            "C",
            handler_fn(|_ctx, _input| async { Ok(StepOutcome::next("{}")) }),
        );
        let err = fx
            .machine
            .run(&TaskContext::detached(&task.tid), &task.tid, &task.params, "a")
            .await
            .unwrap_err();
        assert!(matches!(err, WiseError::MissingStep { ref state, .. } if state == "c"));
    }

    #[tokio::test]
    async fn cancelled_context_stops_between_steps() {
        let store = test_store().await;
        let mut machine = StateMachine::new(store.clone());
        machine.register_state(
            "a",
            "A",
            handler_fn(|ctx: TaskContext, _input| async move {
                ctx.token().cancel();
                Ok(StepOutcome::next("{}"))
            }),
        );
        machine.register_state(
            "b",
            "B",
            handler_fn(|_ctx, _input| async { Ok(StepOutcome::next("{}")) }),
        );

        let task = machine.create_task(&json!({}), "demo", "test").await.unwrap();
        let err = machine
            .run(&TaskContext::detached(&task.tid), &task.tid, &task.params, "a")
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        let steps = store.steps_by_task(&task.tid).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Success);
        assert_eq!(steps[1].status, StepStatus::Init);
    }

    #[tokio::test]
    async fn stored_cancel_stops_before_next_step() {
        let store = test_store().await;
        let mut machine = StateMachine::new(store.clone());
        let writer = store.clone();
        machine.register_state(
            "a",
            "A",
            handler_fn(move |ctx: TaskContext, _input| {
                let writer = writer.clone();
                async move {
                    writer
                        .update_status(ctx.tid(), TaskStatus::Cancelled, "cancelled by request")
                        .await?;
                    Ok(StepOutcome::next("{}"))
                }
            }),
        );
        let b_calls = Arc::new(AtomicUsize::new(0));
        let calls = b_calls.clone();
        machine.register_state(
            "b",
            "B",
            handler_fn(move |_ctx, _input| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(StepOutcome::next("{}"))
                }
            }),
        );

        let task = machine.create_task(&json!({}), "demo", "test").await.unwrap();
        let err = machine
            .run(&TaskContext::detached(&task.tid), &task.tid, &task.params, "a")
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);

        let steps = store.steps_by_task(&task.tid).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Success);
        assert_eq!(steps[1].status, StepStatus::Init);
        let stored = store.get_task(&task.tid).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.current_state, "a");
    }

    #[tokio::test]
    async fn first_step_receives_run_params() {
        let fx = fixture(&["a", "b"]).await;
        let task = fx
            .machine
            .create_task(&json!({"trail": ">"}), "demo", "test")
            .await
            .unwrap();
        fx.machine
            .run(&TaskContext::detached(&task.tid), &task.tid, &task.params, "a")
            .await
            .unwrap();

        let seen = fx.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![r#"{"trail":">"}"#, r#"{"trail":">a"}"#]);
    }
}
