//! Core domain types: tasks, their persisted step chains, and listing queries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WiseError;

/// Placeholder stored in `result`/`extend` before anything is written.
pub const EMPTY_JSON: &str = "{}";

/// Generate a new time-sortable identifier (UUID v7) for tasks and steps.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Init,
    Running,
    Retry,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Init,
        TaskStatus::Running,
        TaskStatus::Retry,
        TaskStatus::Success,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// The persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Retry => "retry",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses the scheduler never picks up again on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = WiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| WiseError::validation(format!("unknown task status '{s}'")))
    }
}

/// Lifecycle status of a [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Init,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl StepStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [StepStatus; 5] = [
        StepStatus::Init,
        StepStatus::Running,
        StepStatus::Success,
        StepStatus::Failed,
        StepStatus::Cancelled,
    ];

    /// The persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = WiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| WiseError::validation(format!("unknown step status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One submitted unit of work, moving through a named pipeline of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Database row id (0 until inserted).
    pub id: i64,
    /// Opaque external identifier.
    pub tid: String,
    /// Human-readable name.
    pub name: String,
    /// Selects the executor that runs this task.
    pub task_type: String,
    pub status: TaskStatus,
    /// Code of the last completed step, or the first step before any run.
    pub current_state: String,
    /// Number of steps created for this task; fixed at creation.
    pub total_steps: u32,
    /// 1-based index of `current_state` in the chain.
    pub current_step: u32,
    pub retry_count: u32,
    /// Serialized input.
    pub params: String,
    /// Serialized output of the latest completed step.
    pub result: String,
    /// Last error message (empty when none).
    pub error: String,
    /// Free-form metadata.
    pub extend: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One persisted stage of a task's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Database row id (0 until inserted).
    pub id: i64,
    /// Owning task.
    pub tid: String,
    /// Unique step identifier.
    pub pid: String,
    /// Previous step in the chain, if any.
    pub before_pid: Option<String>,
    /// Next step in the chain, if any.
    pub next_pid: Option<String>,
    /// State code this step runs.
    pub code: String,
    /// Display name of the state.
    pub name: String,
    /// 1-based position in the chain.
    pub index: u32,
    pub status: StepStatus,
    /// Input fed to this step.
    pub params: String,
    pub result: String,
    pub duration_ms: u64,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Filters and paging for task listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQuery {
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
    /// Substring match on the task name.
    pub name: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
            name: None,
            status: None,
            task_type: None,
        }
    }
}

impl TaskQuery {
    /// Row offset for the requested page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size)
    }
}

/// One page of tasks plus the total number of matches.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub total: u64,
    pub items: Vec<Task>,
}

/// A task together with its full, ordered step chain.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub task: Task,
    pub steps: Vec<Step>,
}
