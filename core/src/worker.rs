use crate::clock::SchedulerClock;
use crate::errors::Result;
use crate::execution::{ExecutionRecord, ExecutionStatus, TriggerKind};
use crate::queue::{FileTaskQueue, TaskEnvelope};
use crate::runner::{CancelToken, PipelineRunner};
use crate::store::ExecutionStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

/// How often an idle worker polls the spool for new envelopes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// [`Worker`] is the consumer side of the distributed queue: a separate process that
/// loops over the spool, claims one envelope at a time, runs it through the same
/// [`PipelineRunner`] the in-process path uses, persists the terminal
/// [`ExecutionRecord`] to the execution store and the result backend, and only then
/// acknowledges the claim
///
/// # Usage Note(s)
/// Acknowledging after completion is what makes a crashed worker's job redeliverable:
/// the claim lease expires and the envelope is swept back into the queue. While a task
/// runs, the worker polls the broker's cancel marker and trips the run's
/// [`CancelToken`] when one appears, so a forced cancel reaches the engine between
/// stages
///
/// # See Also
/// - [`FileTaskQueue`](crate::queue::FileTaskQueue)
/// - [`PipelineRunner`]
#[derive(Clone, TypedBuilder)]
pub struct Worker {
    queue: FileTaskQueue,
    runner: PipelineRunner,
    executions: ExecutionStore,
    clock: Arc<dyn SchedulerClock>,
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    poll_interval: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Worker {
    /// Claims and processes at most one envelope. Returns whether anything was
    /// processed, so callers can poll eagerly while the spool drains and back off
    /// once it is empty
    pub async fn run_once(&self) -> Result<bool> {
        let Some(envelope) = self.queue.claim().await? else {
            return Ok(false);
        };
        self.process(envelope).await?;
        Ok(true)
    }

    /// Loops until the shutdown token trips, idling `poll_interval` between empty
    /// polls. Claim or processing errors are logged and retried, never fatal
    pub async fn run(&self, shutdown: CancelToken) {
        info!(poll_interval = ?self.poll_interval, "worker loop started");
        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => self.clock.idle(self.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "worker iteration failed");
                    self.clock.idle(self.poll_interval).await;
                }
            }
        }
        info!("worker loop stopped");
    }

    async fn process(&self, envelope: TaskEnvelope) -> Result<()> {
        let handle = envelope.task_handle.clone();
        info!(
            task_handle = %handle,
            pipeline = %envelope.pipeline.pipeline_id,
            execution = %envelope.execution_id,
            "processing queued task"
        );

        let now = self.clock.now().await;
        // Reuse the record the submitter persisted when it exists, so the id and
        // trigger survive; fall back to a fresh one for externally produced envelopes.
        let mut record = match self.executions.get(&envelope.execution_id).await {
            Ok(Some(record)) if !record.is_terminal() => record,
            Ok(Some(record)) => {
                warn!(
                    execution = %record.id,
                    status = %record.status,
                    "queued execution already terminal, acknowledging without a run"
                );
                self.queue.acknowledge(&handle);
                return Ok(());
            }
            Ok(None) => ExecutionRecord::started(
                envelope.schedule_id.clone().unwrap_or_default(),
                envelope.pipeline.pipeline_id.clone(),
                TriggerKind::Api,
                now,
            ),
            Err(e) => {
                warn!(error = %e, "could not read submitted record, starting fresh");
                ExecutionRecord::started(
                    envelope.schedule_id.clone().unwrap_or_default(),
                    envelope.pipeline.pipeline_id.clone(),
                    TriggerKind::Api,
                    now,
                )
            }
        };
        record.status = ExecutionStatus::Running;
        self.executions.put(&record).await?;

        let cancel = CancelToken::new();
        let marker = self.queue.cancel_marker_path(&handle);
        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                loop {
                    if marker.exists() {
                        cancel.cancel();
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        });

        let timeout = envelope.timeout_seconds.map(Duration::from_secs);
        self.runner
            .run(&envelope.pipeline, &mut record, cancel, timeout)
            .await;
        watcher.abort();

        self.executions.put(&record).await?;
        self.queue.write_result(&handle, &record).await?;
        self.queue.acknowledge(&handle);
        info!(
            task_handle = %handle,
            execution = %record.id,
            status = %record.status,
            "queued task finished"
        );
        Ok(())
    }
}
