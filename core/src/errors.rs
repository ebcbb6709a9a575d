use std::path::PathBuf;
use thiserror::Error;

/// [`OrchestratorError`] is the main enum that contains all the errors which can be thrown by
/// Pipewright, it uses under the hood [`thiserror`] to make it as smooth sailing to add more
/// errors in the future as possible. Every public fallible operation of the crate funnels its
/// failures through this enum so callers can match on the kind of failure rather than on strings
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// This error is meant to happen when a supplied cron expression cannot be parsed
    /// by the cron dialect the scheduler understands (5 fields, `*`, lists, ranges, steps)
    #[error("invalid cron expression `{0}`")]
    InvalidCron(String),

    /// This error is meant to happen when a mutation would leave the schedule set in an
    /// inconsistent shape, a schedule depending on itself, a duplicated dependency entry,
    /// or any other rejected field value. Nothing is mutated when it is returned
    #[error("validation failed: {0}")]
    Validation(String),

    /// This error is meant to happen when a dependency edge would close a cycle in the
    /// dependency graph. The offending edge is reported as `schedule -> dependency`
    #[error("dependency `{0} -> {1}` would create a cycle")]
    DependencyCycle(String, String),

    /// This error is meant to happen when a schedule id is looked up but no schedule
    /// with that id exists in the in-memory set nor on disk
    #[error("schedule `{0}` not found")]
    ScheduleNotFound(String),

    /// This error is meant to happen when an execution id (or queued task handle) is
    /// looked up but no record of it exists
    #[error("execution `{0}` not found")]
    ExecutionNotFound(String),

    /// This error is meant to happen when a pipeline reference resolves to neither a
    /// readable definition document nor a catalog entry
    #[error("pipeline `{0}` not found")]
    PipelineNotFound(String),

    /// This error is meant to happen when filesystem persistence fails. The mutation that
    /// required durability is reported failed and in-memory state is rolled back to match disk
    #[error("storage failure on `{path}`: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// This error is meant to happen when a persisted document cannot be decoded back
    /// into its runtime shape
    #[error("corrupt document `{path}`: {reason}")]
    CorruptDocument { path: PathBuf, reason: String },

    /// This error is meant to happen when the queue broker (the spool directory) cannot
    /// accept a submission. The tick loop treats it as transient and retries the fire on
    /// the next tick without advancing `next_run`
    #[error("task queue unavailable: {0}")]
    QueueUnavailable(String),

    /// This error is meant to happen when an operation needs the distributed queue but
    /// the orchestrator was built without one configured
    #[error("no task queue is configured")]
    QueueNotConfigured,

    /// This error is meant to happen when a run exceeds the per-schedule timeout. It is
    /// recorded on the execution record with a distinguishable message, never propagated
    /// out of the tick loop
    #[error("execution `{0}` timed out")]
    Timeout(String),

    /// This error is meant to happen when a run is cancelled explicitly by a caller. It
    /// is a terminal outcome distinct from a pipeline failure
    #[error("execution `{0}` was cancelled")]
    Cancelled(String),
}

impl OrchestratorError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Whether the tick loop should hold a fire back (not advance `next_run`) after this
    /// error, so the fire is retried on the very next tick. Broker transience is the one
    /// failure treated that way
    pub fn defers_fire(&self) -> bool {
        matches!(
            self,
            OrchestratorError::QueueUnavailable(_) | OrchestratorError::QueueNotConfigured
        )
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, OrchestratorError>;
