use crate::clock::SchedulerClock;
use crate::errors::{OrchestratorError, Result};
use crate::execution::{ExecutionRecord, ExecutionStatus, TriggerKind};
use crate::queue::{TaskEnvelope, TaskQueue};
use crate::registry::{PipelineConfig, PipelineRegistry};
use crate::runner::{CancelToken, PipelineRunner};
use crate::schedule::{ScheduleConfig, ScheduleUpdate, validate_dependencies};
use crate::store::{ExecutionStore, ScheduleStore};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// [`ExecutionObserver`] is the callback seam external faces subscribe on to learn
/// about finished runs. The scheduler invokes every registered observer after each
/// terminal transition, outside its own lock, and knows nothing about what sits on
/// the other side (a web datastore, a notifier, a metric)
///
/// # See Also
/// - [`Scheduler`]
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn on_execution_complete(&self, record: &ExecutionRecord);
}

/// What one pass of [`Scheduler::tick_at`] did, returned for callers (and tests) that
/// want to assert on it
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Schedules fired on their cron window
    pub fired: usize,
    /// Due schedules deferred by the dependency gate
    pub deferred: usize,
    /// Retry attempts dispatched
    pub retried: usize,
    /// Queued executions observed terminal and folded back in
    pub reaped: usize,
}

/// A follow-up attempt scheduled by the retry policy, waiting for its due instant
#[derive(Debug, Clone)]
struct PendingRetry {
    schedule_id: String,
    due: DateTime<Local>,
    base: ExecutionRecord,
    next_retry_count: u32,
}

#[derive(Default)]
struct SchedulerState {
    /// In-memory authoritative copy of the schedule set, keyed (and iterated) by id
    schedules: BTreeMap<String, ScheduleConfig>,
    /// In-flight executions, by execution id
    running: HashMap<String, ExecutionRecord>,
    /// Task handles of queued in-flight executions, by execution id
    queued: HashMap<String, String>,
    /// Follow-up attempts the retry policy is holding
    retries: Vec<PendingRetry>,
}

/// This is the builder configs to use for building a [`Scheduler`] instance.
/// By itself it should not be used, and it resides in [`Scheduler::builder`]
#[derive(TypedBuilder)]
#[builder(build_method(into = Scheduler))]
pub struct SchedulerConfig {
    /// The durable home of the schedule set; every mutation is flushed here before
    /// the mutating call returns
    schedule_store: ScheduleStore,

    /// The durable append-style history every attempt is recorded in
    execution_store: ExecutionStore,

    /// Resolves pipeline references into executable definitions
    registry: PipelineRegistry,

    /// Executes pipelines in-process, capturing logs and outcome
    runner: PipelineRunner,

    /// The [`SchedulerClock`] the tick loop and every `next_run` computation observe
    /// time through
    ///
    /// # Default Value
    /// Every scheduler uses as default value [`SystemClock`](crate::clock::SystemClock)
    ///
    /// # See Also
    /// - [`SchedulerClock`]
    /// - [`VirtualClock`](crate::clock::VirtualClock)
    #[builder(
        default = Arc::new(crate::clock::SystemClock),
        setter(transform = |clock: impl SchedulerClock + 'static| Arc::new(clock) as Arc<dyn SchedulerClock>),
    )]
    clock: Arc<dyn SchedulerClock>,

    /// The optional distributed queue. When present, fires requested as asynchronous
    /// are submitted here instead of running in-process
    #[builder(default)]
    queue: Option<Arc<dyn TaskQueue>>,

    /// Whether cron fires prefer the queue (when one is configured) over in-process
    /// execution
    #[builder(default = true)]
    dispatch_async: bool,

    /// Observers invoked after every terminal transition
    #[builder(default)]
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl From<SchedulerConfig> for Scheduler {
    fn from(config: SchedulerConfig) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            write_guard: Mutex::new(()),
            schedule_store: config.schedule_store,
            execution_store: config.execution_store,
            registry: config.registry,
            runner: config.runner,
            clock: config.clock,
            queue: config.queue,
            dispatch_async: config.dispatch_async,
            observers: config.observers,
            cancel_tokens: DashMap::new(),
        }
    }
}

/// [`Scheduler`] is the heart of the orchestration core. It owns the in-memory
/// authoritative schedule set, the map of in-flight executions and the tick
/// procedure: walk the schedules in id order, fire the due ones whose dependencies
/// are satisfied, dispatch each fire in-process or onto the queue, record every
/// attempt durably and advance `next_run` whatever the outcome
///
/// # Implementation Detail(s)
/// Two locks guard the state. The coarse state lock of the concurrency model protects
/// the schedule / running maps and is never held across filesystem I/O or pipeline
/// execution; a separate write guard serializes mutations end-to-end (validate, flush
/// to disk, commit in memory) so concurrent public operations cannot interleave their
/// durability steps
///
/// # Usage Note(s)
/// The tick loop is driven externally: call [`Scheduler::tick_at`] periodically (the
/// [`Orchestrator`](crate::orchestrator::Orchestrator) hosts the background loop that
/// does). Ordering within one tick is deterministic: schedules fire in id order, and
/// for a single schedule the Nth firing is persisted before the (N+1)th is dispatched
///
/// # See Also
/// - [`Orchestrator`](crate::orchestrator::Orchestrator)
/// - [`SchedulerConfig`]
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    write_guard: Mutex<()>,
    schedule_store: ScheduleStore,
    execution_store: ExecutionStore,
    registry: PipelineRegistry,
    runner: PipelineRunner,
    clock: Arc<dyn SchedulerClock>,
    queue: Option<Arc<dyn TaskQueue>>,
    dispatch_async: bool,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    cancel_tokens: DashMap<String, CancelToken>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("schedule_store", &self.schedule_store)
            .field("execution_store", &self.execution_store)
            .field("dispatch_async", &self.dispatch_async)
            .finish()
    }
}

impl Scheduler {
    /// Constructs a scheduler builder, used for supplying the stores, the registry,
    /// the runner and the optional composites before constructing a [`Scheduler`]
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfig::builder()
    }

    pub fn clock(&self) -> Arc<dyn SchedulerClock> {
        self.clock.clone()
    }

    /// Reads the durable schedule set into memory. Called once at startup; the
    /// in-memory copy is authoritative from then on
    pub async fn load_schedules(&self) -> Result<usize> {
        let loaded = self.schedule_store.load().await?;
        let count = loaded.len();
        self.state.lock().await.schedules = loaded;
        info!(count, "schedule set loaded");
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Schedule set
    // ------------------------------------------------------------------

    /// Registers a schedule: flushed to the store first, committed in memory after,
    /// so a storage failure leaves no trace
    pub async fn insert_schedule(&self, schedule: ScheduleConfig) -> Result<String> {
        let _write = self.write_guard.lock().await;
        self.schedule_store.put(&schedule).await?;
        let id = schedule.id.clone();
        info!(schedule = %id, next_run = %schedule.next_run, "schedule added");
        self.state.lock().await.schedules.insert(id.clone(), schedule);
        Ok(id)
    }

    /// Applies a partial update. `next_run` is recomputed only when the cron
    /// expression actually changes value, so re-submitting identical fields is
    /// observably a no-op
    pub async fn apply_update(&self, id: &str, update: ScheduleUpdate) -> Result<ScheduleConfig> {
        let _write = self.write_guard.lock().await;
        self.apply_update_inner(id, update).await
    }

    async fn apply_update_inner(&self, id: &str, update: ScheduleUpdate) -> Result<ScheduleConfig> {
        let mut schedule = {
            let state = self.state.lock().await;
            state
                .schedules
                .get(id)
                .cloned()
                .ok_or_else(|| OrchestratorError::ScheduleNotFound(id.to_string()))?
        };

        let now = self.clock.now().await;
        let mut cron_changed = false;
        if let Some(cron) = update.cron_expression {
            cron_changed = cron != schedule.cron_expression;
            schedule.cron_expression = cron;
        }
        if let Some(enabled) = update.enabled {
            schedule.enabled = enabled;
        }
        if let Some(dependencies) = update.dependencies {
            validate_dependencies(id, &dependencies)?;
            self.reject_cycles(id, &dependencies).await?;
            schedule.dependencies = dependencies;
        }
        if let Some(max_retries) = update.max_retries {
            schedule.max_retries = max_retries;
        }
        if let Some(retry_delay) = update.retry_delay_seconds {
            schedule.retry_delay_seconds = retry_delay;
        }
        if let Some(timeout) = update.timeout_seconds {
            schedule.timeout_seconds = timeout;
        }
        if cron_changed {
            schedule.advance_next_run(now)?;
        }
        schedule.updated_at = now;

        self.schedule_store.put(&schedule).await?;
        self.state
            .lock()
            .await
            .schedules
            .insert(id.to_string(), schedule.clone());
        info!(schedule = %id, "schedule updated");
        Ok(schedule)
    }

    /// Removes a schedule from disk and memory. Running executions and history are
    /// untouched; pending retries for it are dropped
    pub async fn remove_schedule(&self, id: &str) -> Result<bool> {
        let _write = self.write_guard.lock().await;
        let existed = self.schedule_store.delete(id).await?;
        let mut state = self.state.lock().await;
        let in_memory = state.schedules.remove(id).is_some();
        state.retries.retain(|retry| retry.schedule_id != id);
        if existed || in_memory {
            info!(schedule = %id, "schedule removed");
        }
        Ok(existed || in_memory)
    }

    pub async fn get_schedule(&self, id: &str) -> Option<ScheduleConfig> {
        self.state.lock().await.schedules.get(id).cloned()
    }

    /// The whole schedule set, in id order
    pub async fn list_schedules(&self) -> Vec<ScheduleConfig> {
        self.state.lock().await.schedules.values().cloned().collect()
    }

    /// Adds one dependency edge, rejecting self-dependencies, duplicates, unknown
    /// targets and anything that would close a cycle
    pub async fn add_dependency(&self, id: &str, dep_id: &str) -> Result<()> {
        let _write = self.write_guard.lock().await;
        let dependencies = {
            let state = self.state.lock().await;
            let schedule = state
                .schedules
                .get(id)
                .ok_or_else(|| OrchestratorError::ScheduleNotFound(id.to_string()))?;
            if !state.schedules.contains_key(dep_id) {
                return Err(OrchestratorError::ScheduleNotFound(dep_id.to_string()));
            }
            if schedule.dependencies.iter().any(|d| d == dep_id) {
                return Err(OrchestratorError::Validation(format!(
                    "schedule `{id}` already depends on `{dep_id}`"
                )));
            }
            let mut dependencies = schedule.dependencies.clone();
            dependencies.push(dep_id.to_string());
            dependencies
        };
        self.apply_update_inner(
            id,
            ScheduleUpdate::builder().dependencies(Some(dependencies)).build(),
        )
        .await?;
        Ok(())
    }

    /// Removes one dependency edge. Fails when the edge does not exist
    pub async fn remove_dependency(&self, id: &str, dep_id: &str) -> Result<()> {
        let _write = self.write_guard.lock().await;
        let dependencies = {
            let state = self.state.lock().await;
            let schedule = state
                .schedules
                .get(id)
                .ok_or_else(|| OrchestratorError::ScheduleNotFound(id.to_string()))?;
            if !schedule.dependencies.iter().any(|d| d == dep_id) {
                return Err(OrchestratorError::Validation(format!(
                    "schedule `{id}` does not depend on `{dep_id}`"
                )));
            }
            schedule
                .dependencies
                .iter()
                .filter(|d| d.as_str() != dep_id)
                .cloned()
                .collect::<Vec<_>>()
        };
        self.apply_update_inner(
            id,
            ScheduleUpdate::builder().dependencies(Some(dependencies)).build(),
        )
        .await?;
        Ok(())
    }

    /// Walks the dependency graph from every proposed dependency; reaching `id`
    /// means the proposed list would close a cycle
    pub(crate) async fn reject_cycles(&self, id: &str, proposed: &[String]) -> Result<()> {
        let state = self.state.lock().await;
        for dep in proposed {
            let mut stack = vec![dep.clone()];
            let mut visited = HashSet::new();
            while let Some(current) = stack.pop() {
                if current == id {
                    return Err(OrchestratorError::DependencyCycle(
                        id.to_string(),
                        dep.clone(),
                    ));
                }
                if !visited.insert(current.clone()) {
                    continue;
                }
                if let Some(schedule) = state.schedules.get(&current) {
                    stack.extend(schedule.dependencies.iter().cloned());
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dependency gate
    // ------------------------------------------------------------------

    /// The gate of the tick procedure: every listed predecessor's latest terminal
    /// record must be SUCCESS. A predecessor with no terminal record at all does not
    /// satisfy the gate, so a new dependent never fires before its predecessor has
    /// succeeded at least once
    pub async fn dependencies_satisfied(&self, schedule: &ScheduleConfig) -> Result<bool> {
        for dep in &schedule.dependencies {
            match self.execution_store.latest_terminal_for_schedule(dep).await? {
                Some(record) if record.status == ExecutionStatus::Success => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// One pass over the schedule set at the clock's current instant
    pub async fn tick(&self) -> TickSummary {
        let now = self.clock.now().await;
        self.tick_at(now).await
    }

    /// One pass over the schedule set at `now`: fold finished queued runs back in,
    /// dispatch due retry attempts, then fire every due schedule (id order) whose
    /// dependency gate passes. Failures are contained per schedule; one bad schedule
    /// cannot take the loop down
    pub async fn tick_at(&self, now: DateTime<Local>) -> TickSummary {
        let reaped = self.reap_queued(now).await;
        let retried = self.dispatch_due_retries(now).await;
        let mut summary = TickSummary {
            reaped,
            retried,
            ..TickSummary::default()
        };

        let due: Vec<ScheduleConfig> = {
            let state = self.state.lock().await;
            state
                .schedules
                .values()
                .filter(|schedule| schedule.is_due(now))
                .cloned()
                .collect()
        };

        for schedule in due {
            match self.fire(&schedule, now).await {
                Ok(true) => summary.fired += 1,
                Ok(false) => summary.deferred += 1,
                Err(e) => {
                    error!(schedule = %schedule.id, error = %e, "fire failed");
                    if !e.defers_fire() {
                        self.advance_schedule(&schedule.id, now).await;
                        summary.fired += 1;
                    }
                }
            }
        }

        if summary.fired > 0 || summary.retried > 0 {
            info!(
                fired = summary.fired,
                deferred = summary.deferred,
                retried = summary.retried,
                "tick summary"
            );
        }
        summary
    }

    /// Pushes every enabled schedule's `next_run` behind `now` so the next tick fires
    /// them all. In-memory only; the genuine `next_run` is recomputed and persisted
    /// by the fires themselves
    pub async fn force_all_due(&self, now: DateTime<Local>) {
        let mut state = self.state.lock().await;
        for schedule in state.schedules.values_mut() {
            if schedule.enabled {
                schedule.next_run = now - chrono::Duration::seconds(1);
            }
        }
    }

    /// Fires one due schedule. Returns `Ok(false)` when the dependency gate deferred
    /// it (`next_run` untouched, reconsidered next tick)
    async fn fire(&self, schedule: &ScheduleConfig, now: DateTime<Local>) -> Result<bool> {
        if !self.dependencies_satisfied(schedule).await? {
            warn!(schedule = %schedule.id, "dependencies unsatisfied, deferring fire");
            return Ok(false);
        }

        info!(
            schedule = %schedule.id,
            pipeline = %schedule.pipeline_ref,
            "firing schedule"
        );

        let config = match self.registry.resolve(&schedule.pipeline_ref).await {
            Ok(config) => config,
            Err(e) => {
                // The fire is charged: a failed record is written and the window
                // advances, exactly as if the pipeline itself had failed.
                let mut record = ExecutionRecord::started(
                    schedule.id.clone(),
                    schedule.pipeline_ref.as_display_string(),
                    TriggerKind::Cron,
                    now,
                );
                record.complete(false, Some(e.to_string()), now);
                self.execution_store.put(&record).await?;
                self.finalize(record).await;
                self.advance_schedule(&schedule.id, now).await;
                return Ok(true);
            }
        };

        let record = ExecutionRecord::started(
            schedule.id.clone(),
            config.pipeline_id.clone(),
            TriggerKind::Cron,
            now,
        );

        // A new window abandons whatever retries the previous one still had
        // pending. Cleared before dispatching, so a retry this very fire
        // schedules is not swept away with them.
        {
            let mut state = self.state.lock().await;
            let before = state.retries.len();
            state.retries.retain(|retry| retry.schedule_id != schedule.id);
            if state.retries.len() != before {
                debug!(schedule = %schedule.id, "abandoning retries from the previous window");
            }
        }

        if self.dispatch_async && self.queue.is_some() {
            self.dispatch_queued(schedule, &config, record).await?;
        } else {
            self.dispatch_in_process(schedule, &config, record, true, now)
                .await?;
        }

        self.advance_schedule(&schedule.id, now).await;
        Ok(true)
    }

    /// Submits a fire onto the distributed queue. The record is persisted (RUNNING)
    /// only once the broker accepted the envelope, so a broker failure leaves
    /// nothing behind and the fire is retried next tick
    async fn dispatch_queued(
        &self,
        schedule: &ScheduleConfig,
        config: &PipelineConfig,
        record: ExecutionRecord,
    ) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or(OrchestratorError::QueueNotConfigured)?;
        let envelope = TaskEnvelope {
            task_handle: Uuid::new_v4().to_string(),
            execution_id: record.id.clone(),
            schedule_id: Some(schedule.id.clone()),
            pipeline: config.clone(),
            timeout_seconds: schedule.timeout_seconds,
            submitted_at: record.start_time,
        };
        let handle = queue.submit(envelope).await?;
        self.execution_store.put(&record).await?;
        let mut state = self.state.lock().await;
        state.queued.insert(record.id.clone(), handle);
        state.running.insert(record.id.clone(), record);
        Ok(())
    }

    /// Runs a fire in-process, synchronously. The record is persisted RUNNING before
    /// the pipeline starts and re-persisted at its terminal (or retrying) state
    async fn dispatch_in_process(
        &self,
        schedule: &ScheduleConfig,
        config: &PipelineConfig,
        mut record: ExecutionRecord,
        allow_retry: bool,
        now: DateTime<Local>,
    ) -> Result<()> {
        self.execution_store.put(&record).await?;
        let cancel = CancelToken::new();
        self.cancel_tokens.insert(record.id.clone(), cancel.clone());
        self.state
            .lock()
            .await
            .running
            .insert(record.id.clone(), record.clone());

        let timeout = schedule.timeout_seconds.map(Duration::from_secs);
        self.runner.run(config, &mut record, cancel, timeout).await;

        if allow_retry
            && record.status == ExecutionStatus::Failed
            && record.retry_count < schedule.max_retries
        {
            let message = record
                .error_message
                .clone()
                .unwrap_or_else(|| "pipeline failed".to_string());
            record.mark_retrying(message, self.clock.now().await);
            let due = now + chrono::Duration::seconds(schedule.retry_delay_seconds as i64);
            warn!(
                schedule = %schedule.id,
                execution = %record.id,
                retry = record.retry_count + 1,
                max_retries = schedule.max_retries,
                due = %due,
                "scheduling retry attempt"
            );
            let pending = PendingRetry {
                schedule_id: schedule.id.clone(),
                due,
                base: record.clone(),
                next_retry_count: record.retry_count + 1,
            };
            self.execution_store.put(&record).await?;
            let mut state = self.state.lock().await;
            state.running.remove(&record.id);
            state.retries.push(pending);
            self.cancel_tokens.remove(&record.id);
            return Ok(());
        }

        self.execution_store.put(&record).await?;
        self.finalize(record).await;
        Ok(())
    }

    /// Dispatches every pending retry whose due instant has passed. A retry is a
    /// fresh record on the same chain; exhausting the budget is what produces the
    /// terminal FAILED
    async fn dispatch_due_retries(&self, now: DateTime<Local>) -> usize {
        let due: Vec<PendingRetry> = {
            let mut state = self.state.lock().await;
            let (ready, waiting): (Vec<_>, Vec<_>) =
                state.retries.drain(..).partition(|retry| retry.due <= now);
            state.retries = waiting;
            ready
        };

        let mut dispatched = 0;
        for retry in due {
            let Some(schedule) = self.get_schedule(&retry.schedule_id).await else {
                debug!(schedule = %retry.schedule_id, "dropping retry for removed schedule");
                continue;
            };
            let record = retry.base.retry_attempt(retry.next_retry_count, now);
            let config = match self.registry.resolve(&schedule.pipeline_ref).await {
                Ok(config) => config,
                Err(e) => {
                    warn!(schedule = %schedule.id, error = %e, "retry could not resolve pipeline");
                    continue;
                }
            };
            if let Err(e) = self
                .dispatch_in_process(&schedule, &config, record, true, now)
                .await
            {
                error!(schedule = %schedule.id, error = %e, "retry dispatch failed");
                continue;
            }
            dispatched += 1;
        }
        dispatched
    }

    /// Folds queued executions the workers have finished back into the scheduler:
    /// terminal records leave the running map, update the owning schedule and reach
    /// the observers
    async fn reap_queued(&self, _now: DateTime<Local>) -> usize {
        let queued: Vec<(String, String)> = {
            let state = self.state.lock().await;
            state
                .queued
                .iter()
                .map(|(id, handle)| (id.clone(), handle.clone()))
                .collect()
        };

        let mut reaped = 0;
        for (execution_id, _handle) in queued {
            match self.execution_store.get(&execution_id).await {
                Ok(Some(record)) if record.is_terminal() => {
                    debug!(execution = %execution_id, status = %record.status, "queued execution finished");
                    self.finalize(record).await;
                    reaped += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(execution = %execution_id, error = %e, "could not read queued execution");
                }
            }
        }
        reaped
    }

    /// Advances a schedule's `next_run` past `now` and flushes it, even when the run
    /// itself failed. Losing the flush is logged but does not roll the advancement
    /// back, so a broken disk cannot refire the same window in a tight loop
    async fn advance_schedule(&self, id: &str, now: DateTime<Local>) {
        let updated = {
            let mut state = self.state.lock().await;
            let Some(schedule) = state.schedules.get_mut(id) else {
                return;
            };
            if let Err(e) = schedule.advance_next_run(now) {
                error!(schedule = %id, error = %e, "could not advance next_run");
                return;
            }
            debug!(schedule = %id, next_run = %schedule.next_run, "next_run advanced");
            schedule.clone()
        };
        if let Err(e) = self.schedule_store.put(&updated).await {
            error!(schedule = %id, error = %e, "could not persist advanced schedule");
        }
    }

    /// Terminal bookkeeping shared by every dispatch path: drop the run from the
    /// in-flight maps, stamp the owning schedule's informational last-run fields and
    /// notify the observers. The caller has already persisted the record
    async fn finalize(&self, record: ExecutionRecord) {
        self.cancel_tokens.remove(&record.id);
        let owning_schedule = {
            let mut state = self.state.lock().await;
            state.running.remove(&record.id);
            state.queued.remove(&record.id);
            if let Some(schedule) = state.schedules.get_mut(&record.schedule_id) {
                schedule.last_run_time = Some(record.start_time);
                schedule.last_run_status = Some(record.status);
                Some(schedule.clone())
            } else {
                None
            }
        };
        if let Some(schedule) = owning_schedule
            && let Err(e) = self.schedule_store.put(&schedule).await
        {
            warn!(schedule = %schedule.id, error = %e, "could not persist last-run fields");
        }
        for observer in &self.observers {
            observer.on_execution_complete(&record).await;
        }
    }

    // ------------------------------------------------------------------
    // Manual runs, status, cancellation
    // ------------------------------------------------------------------

    /// Dispatches a schedule on demand. Manual runs bypass the dependency gate, do
    /// not advance `next_run` and do not schedule retry attempts. Returns the
    /// execution id
    pub async fn run_now(
        &self,
        id: &str,
        trigger: TriggerKind,
        async_requested: bool,
    ) -> Result<String> {
        let schedule = self
            .get_schedule(id)
            .await
            .ok_or_else(|| OrchestratorError::ScheduleNotFound(id.to_string()))?;
        let config = self.registry.resolve(&schedule.pipeline_ref).await?;
        let now = self.clock.now().await;
        let record = ExecutionRecord::started(
            schedule.id.clone(),
            config.pipeline_id.clone(),
            trigger,
            now,
        );
        let execution_id = record.id.clone();

        if async_requested && self.queue.is_some() {
            self.dispatch_queued(&schedule, &config, record).await?;
        } else {
            // No queue configured is not an error, the run simply happens here.
            self.dispatch_in_process(&schedule, &config, record, false, now)
                .await?;
        }
        Ok(execution_id)
    }

    /// Looks an execution up: in-flight first, then the durable history, then as a
    /// queued task handle
    pub async fn execution_status(&self, id_or_handle: &str) -> Result<ExecutionRecord> {
        {
            let state = self.state.lock().await;
            if let Some(record) = state.running.get(id_or_handle) {
                return Ok(record.clone());
            }
            // A task handle maps back to its execution.
            if let Some((execution_id, _)) = state
                .queued
                .iter()
                .find(|(_, handle)| handle.as_str() == id_or_handle)
            {
                if let Some(record) = state.running.get(execution_id) {
                    return Ok(record.clone());
                }
            }
        }
        if let Some(record) = self.execution_store.get(id_or_handle).await? {
            return Ok(record);
        }
        Err(OrchestratorError::ExecutionNotFound(id_or_handle.to_string()))
    }

    /// Best-effort cancellation of an in-flight execution. In-process runs get their
    /// cancel token tripped; queued runs are withdrawn (pending) or signalled
    /// (running, forced). Returns whether anything was affected
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<bool> {
        // In-process: trip the token the engine polls between stages.
        if let Some(token) = self.cancel_tokens.get(execution_id) {
            token.cancel();
            info!(execution = %execution_id, "cancel requested for in-process run");
            return Ok(true);
        }

        let handle = {
            let state = self.state.lock().await;
            state.queued.get(execution_id).cloned()
        };
        if let Some(handle) = handle {
            let queue = self
                .queue
                .as_ref()
                .ok_or(OrchestratorError::QueueNotConfigured)?;
            let affected = queue.cancel(&handle, true).await?;
            if affected && matches!(queue.status(&handle).await?, crate::queue::TaskStatus::Unknown)
            {
                // Withdrawn before any worker claimed it: the record will never be
                // touched again, close it out here.
                if let Some(mut record) = self.execution_store.get(execution_id).await? {
                    record.mark_cancelled(self.clock.now().await);
                    self.execution_store.put(&record).await?;
                    self.finalize(record).await;
                }
            }
            return Ok(affected);
        }

        // Not tracked in this process; a stale RUNNING record can still be closed.
        match self.execution_store.get(execution_id).await? {
            Some(mut record) if !record.is_terminal() => {
                record.mark_cancelled(self.clock.now().await);
                self.execution_store.put(&record).await?;
                self.finalize(record).await;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(OrchestratorError::ExecutionNotFound(
                execution_id.to_string(),
            )),
        }
    }

    /// Ids of currently in-flight executions
    pub async fn running_executions(&self) -> Vec<ExecutionRecord> {
        self.state.lock().await.running.values().cloned().collect()
    }
}
