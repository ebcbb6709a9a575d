use crate::clock::SchedulerClock;
use crate::execution::ExecutionRecord;
use crate::registry::PipelineConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

/// Error message recorded when a run exceeds its per-schedule timeout. Kept stable so
/// operators and retry tooling can distinguish timeouts from ordinary failures
pub const TIMEOUT_ERROR_MESSAGE: &str = "timeout";

/// [`CancelToken`] is the soft-cancellation flag threaded through every in-process run.
/// Engines are expected to check it between their extract / transform / load stages;
/// cancellation is therefore best-effort, never preemptive
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// [`LogSink`] collects the log lines a pipeline run emits. The runner drains it into
/// the execution record afterwards (and mirrors it to the detailed log stream when a
/// logs directory is configured), so engines only ever push lines
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.into());
        }
    }

    pub fn drain(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(mut lines) => std::mem::take(&mut *lines),
            Err(_) => Vec::new(),
        }
    }
}

/// How a pipeline run can end, from the engine's point of view
#[derive(Error, Debug)]
pub enum EngineError {
    /// The ETL raised; the message ends up on the execution record
    #[error("{0}")]
    Failed(String),

    /// The engine observed the cancel token and stopped between stages
    #[error("cancelled between stages")]
    Cancelled,
}

/// [`PipelineEngine`] is the seam to the external ETL runtime. The orchestration core
/// treats "run a pipeline" as this one opaque call returning success or failure plus a
/// log stream; extractors, transformers and loaders live entirely behind it
///
/// # Required Method(s)
/// When implementing the [`PipelineEngine`], one has to supply an implementation for
/// [`PipelineEngine::execute`] which runs the given definition to completion, pushing
/// progress lines into the [`LogSink`] and checking the [`CancelToken`] between stages
///
/// # Trait Implementation(s)
/// The crate ships [`NoopEngine`], which records the invocation and succeeds. Hosts
/// plug their real runtime in through
/// [`OrchestratorConfig`](crate::orchestrator::OrchestratorConfig)
///
/// # See Also
/// - [`PipelineRunner`]
/// - [`NoopEngine`]
#[async_trait]
pub trait PipelineEngine: Send + Sync {
    async fn execute(
        &self,
        config: &PipelineConfig,
        log: &LogSink,
        cancel: &CancelToken,
    ) -> std::result::Result<(), EngineError>;
}

/// [`NoopEngine`] is the built-in placeholder implementation of [`PipelineEngine`]: it
/// logs the invocation and reports success. The CLI runs on it unless a host wires a
/// real runtime in, which keeps the orchestration core demonstrable without one
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEngine;

#[async_trait]
impl PipelineEngine for NoopEngine {
    async fn execute(
        &self,
        config: &PipelineConfig,
        log: &LogSink,
        _cancel: &CancelToken,
    ) -> std::result::Result<(), EngineError> {
        log.push(format!("pipeline `{}` executed (no-op engine)", config.pipeline_id));
        Ok(())
    }
}

/// [`PipelineRunner`] executes a pipeline synchronously in the current process: it
/// invokes the [`PipelineEngine`], captures the emitted log lines onto the execution
/// record, enforces the optional per-run timeout and translates the outcome into the
/// record's terminal state
///
/// # Usage Note(s)
/// [`PipelineRunner::run`] never raises to its caller; every failure mode (engine
/// error, timeout, cancellation) is reflected in the record instead. The retry
/// decision is deliberately not made here, the scheduler owns it
///
/// # See Also
/// - [`PipelineEngine`]
/// - [`ExecutionRecord`]
#[derive(Clone, TypedBuilder)]
pub struct PipelineRunner {
    engine: Arc<dyn PipelineEngine>,
    clock: Arc<dyn SchedulerClock>,

    /// When set, every run also mirrors its captured lines into
    /// `execution_<execution_id>.log` inside this directory
    #[builder(default)]
    logs_dir: Option<PathBuf>,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("logs_dir", &self.logs_dir)
            .finish()
    }
}

impl PipelineRunner {
    /// Runs `config` to completion and stamps the outcome onto `record`. The record
    /// leaves this method in a terminal state (SUCCESS, FAILED or CANCELLED) with its
    /// end time set
    pub async fn run(
        &self,
        config: &PipelineConfig,
        record: &mut ExecutionRecord,
        cancel: CancelToken,
        timeout: Option<Duration>,
    ) {
        let sink = LogSink::new();
        info!(
            pipeline = %config.pipeline_id,
            execution = %record.id,
            "pipeline run starting"
        );

        let outcome = match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.engine.execute(config, &sink, &cancel)).await
                {
                    Ok(result) => result,
                    Err(_) => {
                        // Signal the engine to stop; the run is already charged as a
                        // timeout whatever it does next.
                        cancel.cancel();
                        Err(EngineError::Failed(TIMEOUT_ERROR_MESSAGE.to_string()))
                    }
                }
            }
            None => self.engine.execute(config, &sink, &cancel).await,
        };

        for line in sink.drain() {
            record.append_log(line);
        }

        let now = self.clock.now().await;
        match outcome {
            Ok(()) => {
                record.complete(true, None, now);
                info!(pipeline = %config.pipeline_id, execution = %record.id, "pipeline run succeeded");
            }
            Err(EngineError::Cancelled) => {
                record.mark_cancelled(now);
                warn!(pipeline = %config.pipeline_id, execution = %record.id, "pipeline run cancelled");
            }
            Err(EngineError::Failed(message)) => {
                error!(
                    pipeline = %config.pipeline_id,
                    execution = %record.id,
                    error = %message,
                    "pipeline run failed"
                );
                record.complete(false, Some(message), now);
            }
        }

        self.mirror_logs(record).await;
    }

    async fn mirror_logs(&self, record: &ExecutionRecord) {
        let Some(dir) = &self.logs_dir else { return };
        if record.logs.is_empty() {
            return;
        }
        let path = dir.join(format!("execution_{}.log", record.id));
        let body = record.logs.join("\n") + "\n";
        if let Err(e) = tokio::fs::write(&path, body).await {
            warn!(path = %path.display(), error = %e, "could not mirror execution log stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::execution::{ExecutionStatus, TriggerKind};
    use chrono::{Local, TimeZone};

    struct FailingEngine;

    #[async_trait]
    impl PipelineEngine for FailingEngine {
        async fn execute(
            &self,
            _config: &PipelineConfig,
            log: &LogSink,
            _cancel: &CancelToken,
        ) -> std::result::Result<(), EngineError> {
            log.push("extract: ok");
            Err(EngineError::Failed("loader refused connection".into()))
        }
    }

    struct HangingEngine;

    #[async_trait]
    impl PipelineEngine for HangingEngine {
        async fn execute(
            &self,
            _config: &PipelineConfig,
            _log: &LogSink,
            cancel: &CancelToken,
        ) -> std::result::Result<(), EngineError> {
            loop {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    fn runner(engine: Arc<dyn PipelineEngine>) -> PipelineRunner {
        let start = Local.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        PipelineRunner::builder()
            .engine(engine)
            .clock(Arc::new(VirtualClock::new(start)))
            .build()
    }

    fn fresh_record() -> ExecutionRecord {
        let start = Local.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        ExecutionRecord::started("sched", "pipe", TriggerKind::Manual, start)
    }

    #[tokio::test]
    async fn success_captures_logs_and_completes() {
        let mut record = fresh_record();
        runner(Arc::new(NoopEngine))
            .run(&PipelineConfig::bare("pipe"), &mut record, CancelToken::new(), None)
            .await;
        assert_eq!(record.status, ExecutionStatus::Success);
        assert!(record.end_time.is_some());
        assert_eq!(record.logs.len(), 1);
    }

    #[tokio::test]
    async fn failure_is_reflected_on_the_record_not_raised() {
        let mut record = fresh_record();
        runner(Arc::new(FailingEngine))
            .run(&PipelineConfig::bare("pipe"), &mut record, CancelToken::new(), None)
            .await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("loader refused connection"));
        assert_eq!(record.logs, vec!["extract: ok".to_string()]);
    }

    #[tokio::test]
    async fn timeout_fails_with_the_distinguishable_message() {
        let mut record = fresh_record();
        let cancel = CancelToken::new();
        runner(Arc::new(HangingEngine))
            .run(
                &PipelineConfig::bare("pipe"),
                &mut record,
                cancel.clone(),
                Some(Duration::from_millis(50)),
            )
            .await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some(TIMEOUT_ERROR_MESSAGE));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_engines_reach_the_cancelled_state() {
        let mut record = fresh_record();
        let cancel = CancelToken::new();
        cancel.cancel();
        runner(Arc::new(HangingEngine))
            .run(&PipelineConfig::bare("pipe"), &mut record, cancel, None)
            .await;
        assert_eq!(record.status, ExecutionStatus::Cancelled);
    }
}
