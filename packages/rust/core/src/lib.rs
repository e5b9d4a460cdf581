//! Durable task scheduling for Wise.
//!
//! This crate provides:
//! - [`StateMachine`]: drives one task through its persisted, resumable step chain
//! - [`TaskExecutor`] / [`PipelineExecutor`]: binds a task type to a pipeline and retry policy
//! - [`TaskScheduler`]: polls the task table and runs eligible tasks under a bounded worker pool
//! - [`pipelines`]: the built-in `url_mark` capture pipeline

pub mod context;
pub mod executor;
pub mod pipelines;
pub mod scheduler;
pub mod state_machine;

pub use context::TaskContext;
pub use executor::{PipelineExecutor, TaskExecutor};
pub use pipelines::{URL_MARK, UrlMarkArgs, url_mark_executor};
pub use scheduler::TaskScheduler;
pub use state_machine::{
    FnHandler, StateInfo, StateMachine, StepHandler, StepOutcome, Transition, handler_fn,
};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use wise_shared::new_id;
    use wise_storage::{PipelineStore, Storage};

    /// A fresh temp-file database per test.
    pub async fn test_store() -> Arc<dyn PipelineStore> {
        let path = std::env::temp_dir().join(format!("wise_core_test_{}.db", new_id()));
        Arc::new(Storage::open(&path).await.expect("open test db"))
    }
}
