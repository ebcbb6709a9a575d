pub mod file_queue;

pub use file_queue::FileTaskQueue;

use crate::errors::Result;
use crate::registry::PipelineConfig;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a queued task, as far as the broker can tell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Submitted, not yet claimed by a worker
    Pending,
    /// Claimed by a worker, running
    Running,
    /// Finished successfully
    Success,
    /// Finished unsuccessfully (failed or cancelled)
    Failure,
    /// The broker has no trace of the handle
    Unknown,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// [`TaskEnvelope`] is the unit a worker pulls off the queue: the pipeline definition
/// to run plus enough execution context to produce a correct [`ExecutionRecord`]
/// without reaching back into the submitting process
///
/// [`ExecutionRecord`]: crate::execution::ExecutionRecord
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    pub task_handle: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    pub pipeline: PipelineConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    pub submitted_at: DateTime<Local>,
}

/// [`TaskQueue`] delegates pipeline execution to a distributed worker pool. Submission
/// is non-blocking: it returns a task handle before execution starts, and everything
/// after that is observed through [`TaskQueue::status`]
///
/// # Usage Note(s)
/// Configuring a queue is optional. An orchestrator built without one simply executes
/// in-process, which is not an error
///
/// # Trait Implementation(s)
/// The crate ships [`FileTaskQueue`], a filesystem spool a separate worker process
/// consumes with late acknowledgement (a crashed worker's claim is swept back into the
/// queue once its lease expires)
///
/// # See Also
/// - [`FileTaskQueue`]
/// - [`crate::worker::Worker`]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submits a pipeline for execution. Returns the task handle identifying the
    /// submission; the execution itself has not started when this returns
    async fn submit(&self, envelope: TaskEnvelope) -> Result<String>;

    /// Reports what the broker knows about a handle
    async fn status(&self, task_handle: &str) -> Result<TaskStatus>;

    /// Cancels a task. A pending task is withdrawn outright; a running one is only
    /// signalled when `force` is set, and cancellation remains best-effort either way.
    /// Returns whether anything was actually affected
    async fn cancel(&self, task_handle: &str, force: bool) -> Result<bool>;

    /// Handles of every currently claimed task
    async fn active_tasks(&self) -> Result<Vec<String>>;
}
