use crate::errors::{OrchestratorError, Result};
use crate::execution::{ExecutionRecord, ExecutionStatus};
use crate::queue::{TaskEnvelope, TaskQueue, TaskStatus};
use crate::store::{read_json, write_json_atomic};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a claimed envelope may sit in `active/` before it is considered abandoned
/// and swept back into the queue for redelivery
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(30 * 60);

/// [`FileTaskQueue`] is the filesystem-spool implementation of [`TaskQueue`]: the
/// broker URL names a directory, pending envelopes live in its `queue/` subdirectory
/// and claimed ones in `active/`, with claims taken by atomic rename so concurrent
/// workers never double-claim
///
/// # Implementation Detail(s)
/// Acknowledgement is late: the claim file stays in `active/` until the worker finishes
/// and deletes it, and claims older than the lease window are swept back into `queue/`,
/// so the job of a crashed worker is redelivered rather than lost. Terminal results are
/// written to the result-backend directory as `<task_handle>.json`, carrying the
/// terminal [`ExecutionRecord`]
///
/// # Constructor(s)
/// [`FileTaskQueue::open`] creates the spool and result directories and applies the
/// default claim lease; [`FileTaskQueue::with_lease`] overrides the lease, which tests
/// use to exercise redelivery without waiting
///
/// # See Also
/// - [`TaskQueue`]
/// - [`crate::worker::Worker`]
#[derive(Debug, Clone)]
pub struct FileTaskQueue {
    pending_dir: PathBuf,
    active_dir: PathBuf,
    results_dir: PathBuf,
    lease: Duration,
}

impl FileTaskQueue {
    pub fn open(broker_dir: impl Into<PathBuf>, results_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_lease(broker_dir, results_dir, DEFAULT_CLAIM_LEASE)
    }

    pub fn with_lease(
        broker_dir: impl Into<PathBuf>,
        results_dir: impl Into<PathBuf>,
        lease: Duration,
    ) -> Result<Self> {
        let broker_dir = broker_dir.into();
        let queue = Self {
            pending_dir: broker_dir.join("queue"),
            active_dir: broker_dir.join("active"),
            results_dir: results_dir.into(),
            lease,
        };
        for dir in [&queue.pending_dir, &queue.active_dir, &queue.results_dir] {
            std::fs::create_dir_all(dir).map_err(|e| OrchestratorError::storage(dir, e))?;
        }
        Ok(queue)
    }

    /// Stamps a fresh task handle
    pub fn next_handle() -> String {
        Uuid::new_v4().to_string()
    }

    fn pending_path(&self, handle: &str) -> PathBuf {
        self.pending_dir.join(format!("{handle}.json"))
    }

    fn active_path(&self, handle: &str) -> PathBuf {
        self.active_dir.join(format!("{handle}.json"))
    }

    fn result_path(&self, handle: &str) -> PathBuf {
        self.results_dir.join(format!("{handle}.json"))
    }

    /// Path of the best-effort cancel marker a worker polls while running the task
    pub fn cancel_marker_path(&self, handle: &str) -> PathBuf {
        self.active_dir.join(format!("{handle}.cancel"))
    }

    fn handles_in(dir: &Path) -> Result<Vec<String>> {
        let mut handles = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(handles),
            Err(e) => return Err(OrchestratorError::storage(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| OrchestratorError::storage(dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                handles.push(stem.to_string());
            }
        }
        handles.sort();
        Ok(handles)
    }

    /// Moves claims whose lease has expired back into the queue so they are
    /// redelivered. Called on every claim attempt
    fn sweep_expired_claims(&self) -> Result<()> {
        for handle in Self::handles_in(&self.active_dir)? {
            let active = self.active_path(&handle);
            let age = std::fs::metadata(&active)
                .and_then(|m| m.modified())
                .map(|m| SystemTime::now().duration_since(m).unwrap_or_default())
                .unwrap_or_default();
            if age >= self.lease {
                warn!(task_handle = %handle, "claim lease expired, requeueing for redelivery");
                let _ = std::fs::rename(&active, self.pending_path(&handle));
            }
        }
        Ok(())
    }

    /// Claims the oldest pending envelope by renaming it into `active/`. Returns
    /// `None` when the queue is empty. Losing the rename race to a sibling worker is
    /// treated as "nothing to claim this round"
    pub async fn claim(&self) -> Result<Option<TaskEnvelope>> {
        self.sweep_expired_claims()?;
        for handle in Self::handles_in(&self.pending_dir)? {
            let pending = self.pending_path(&handle);
            let active = self.active_path(&handle);
            match std::fs::rename(&pending, &active) {
                Ok(()) => {
                    let envelope = read_json::<TaskEnvelope>(&active).await?;
                    debug!(task_handle = %handle, "claimed task envelope");
                    return Ok(Some(envelope));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(OrchestratorError::storage(&pending, e)),
            }
        }
        Ok(None)
    }

    /// Acknowledges a finished task: the claim and any cancel marker are removed.
    /// Only called after the terminal result has been persisted
    pub fn acknowledge(&self, handle: &str) {
        let _ = std::fs::remove_file(self.active_path(handle));
        let _ = std::fs::remove_file(self.cancel_marker_path(handle));
    }

    /// Persists the terminal record of a queued run to the result backend
    pub async fn write_result(&self, handle: &str, record: &ExecutionRecord) -> Result<()> {
        write_json_atomic(&self.result_path(handle), record).await
    }

    /// Loads the terminal record of a queued run, if the worker has reported back yet
    pub async fn load_result(&self, handle: &str) -> Result<Option<ExecutionRecord>> {
        let path = self.result_path(handle);
        match read_json::<ExecutionRecord>(&path).await {
            Ok(record) => Ok(Some(record)),
            Err(OrchestratorError::Storage { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TaskQueue for FileTaskQueue {
    async fn submit(&self, envelope: TaskEnvelope) -> Result<String> {
        let handle = envelope.task_handle.clone();
        let path = self.pending_path(&handle);
        write_json_atomic(&path, &envelope)
            .await
            .map_err(|e| OrchestratorError::QueueUnavailable(e.to_string()))?;
        info!(
            task_handle = %handle,
            pipeline = %envelope.pipeline.pipeline_id,
            "task submitted to queue"
        );
        Ok(handle)
    }

    async fn status(&self, task_handle: &str) -> Result<TaskStatus> {
        if self.pending_path(task_handle).exists() {
            return Ok(TaskStatus::Pending);
        }
        if self.active_path(task_handle).exists() {
            return Ok(TaskStatus::Running);
        }
        if let Some(record) = self.load_result(task_handle).await? {
            return Ok(match record.status {
                ExecutionStatus::Success => TaskStatus::Success,
                _ => TaskStatus::Failure,
            });
        }
        Ok(TaskStatus::Unknown)
    }

    async fn cancel(&self, task_handle: &str, force: bool) -> Result<bool> {
        // A pending task is withdrawn outright.
        match std::fs::remove_file(self.pending_path(task_handle)) {
            Ok(()) => {
                info!(task_handle = %task_handle, "pending task withdrawn");
                return Ok(true);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(OrchestratorError::storage(self.pending_path(task_handle), e)),
        }
        if force && self.active_path(task_handle).exists() {
            let marker = self.cancel_marker_path(task_handle);
            std::fs::write(&marker, b"")
                .map_err(|e| OrchestratorError::storage(&marker, e))?;
            info!(task_handle = %task_handle, "cancel requested for running task");
            return Ok(true);
        }
        Ok(false)
    }

    async fn active_tasks(&self) -> Result<Vec<String>> {
        Self::handles_in(&self.active_dir)
    }
}
