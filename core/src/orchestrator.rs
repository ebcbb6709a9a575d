use crate::clock::SchedulerClock;
use crate::config::{DEFAULT_TICK_INTERVAL, Settings, StorageLayout};
use crate::errors::{OrchestratorError, Result};
use crate::execution::{ExecutionRecord, TriggerKind};
use crate::queue::{FileTaskQueue, TaskQueue};
use crate::reconcile::{ReconcileSummary, ScheduleCatalog};
use crate::registry::{FilePipelineCatalog, PipelineCatalog, PipelineRegistry};
use crate::runner::{NoopEngine, PipelineEngine, PipelineRunner};
use crate::schedule::{ScheduleConfig, ScheduleSpec, ScheduleUpdate};
use crate::scheduler::{ExecutionObserver, Scheduler, TickSummary};
use crate::store::{ExecutionFilter, ExecutionStore, ScheduleStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

/// This is the builder configs to use for building an [`Orchestrator`] instance.
/// By itself it should not be used, and it resides in [`Orchestrator::builder`]
#[derive(TypedBuilder)]
#[builder(build_method(into = Orchestrator))]
pub struct OrchestratorConfig {
    /// Where every durable artifact lives. The conventional directory tree is
    /// derived from this base directory
    ///
    /// # Default Value
    /// [`StorageLayout::default_base`], i.e. the per-user state directory (honoring
    /// the `STORAGE_BASE_DIR` environment variable)
    #[builder(default = StorageLayout::default_base())]
    layout: StorageLayout,

    /// The external ETL runtime the runner invokes
    ///
    /// # Default Value
    /// [`NoopEngine`], which records invocations and succeeds. Hosts embedding the
    /// core plug their real engine in here
    ///
    /// # See Also
    /// - [`PipelineEngine`]
    #[builder(
        default = Arc::new(NoopEngine),
        setter(transform = |engine: impl PipelineEngine + 'static| Arc::new(engine) as Arc<dyn PipelineEngine>),
    )]
    engine: Arc<dyn PipelineEngine>,

    /// The clock the scheduler observes time through
    ///
    /// # Default Value
    /// [`SystemClock`](crate::clock::SystemClock). Tests substitute a
    /// [`VirtualClock`](crate::clock::VirtualClock)
    #[builder(
        default = Arc::new(crate::clock::SystemClock),
        setter(transform = |clock: impl SchedulerClock + 'static| Arc::new(clock) as Arc<dyn SchedulerClock>),
    )]
    clock: Arc<dyn SchedulerClock>,

    /// The lookup for bare pipeline ids
    ///
    /// # Default Value
    /// The filesystem catalog over the layout's `pipelines/` directory
    #[builder(default)]
    catalog: Option<Arc<dyn PipelineCatalog>>,

    /// The optional distributed queue. Absent means every dispatch is in-process,
    /// which is not an error
    #[builder(default)]
    queue: Option<Arc<dyn TaskQueue>>,

    /// Whether cron fires use the queue when one is configured
    #[builder(default = true)]
    dispatch_async: bool,

    /// Observers invoked after every terminal transition
    #[builder(default)]
    observers: Vec<Arc<dyn ExecutionObserver>>,

    /// Tick cadence used by [`Orchestrator::start_tick_loop`] when the caller does
    /// not override it
    #[builder(default = DEFAULT_TICK_INTERVAL)]
    tick_interval: Duration,
}

impl From<OrchestratorConfig> for Orchestrator {
    fn from(config: OrchestratorConfig) -> Self {
        if let Err(e) = config.layout.ensure() {
            warn!(error = %e, "could not pre-create the storage layout");
        }
        let catalog = config
            .catalog
            .unwrap_or_else(|| Arc::new(FilePipelineCatalog::new(config.layout.pipelines_dir())));
        let runner = PipelineRunner::builder()
            .engine(config.engine)
            .clock(config.clock.clone())
            .logs_dir(Some(config.layout.logs_dir()))
            .build();
        let scheduler = Scheduler::builder()
            .schedule_store(ScheduleStore::new(config.layout.schedules_dir()))
            .execution_store(ExecutionStore::new(config.layout.executions_dir()))
            .registry(PipelineRegistry::new(catalog))
            .runner(runner)
            .clock(config.clock.clone())
            .queue(config.queue)
            .dispatch_async(config.dispatch_async)
            .observers(config.observers)
            .build();
        Self {
            scheduler: Arc::new(scheduler),
            layout: config.layout,
            clock: config.clock,
            tick_interval: config.tick_interval,
            tick_loop: Mutex::new(None),
        }
    }
}

struct TickLoopHandle {
    task: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// [`Orchestrator`] is the public façade of the orchestration core: schedule CRUD,
/// on-demand runs, status queries, cancellation, the background tick loop and
/// reconciliation against an external catalog. Every operation delegates to the
/// [`Scheduler`] and the stores underneath
///
/// # Constructor(s)
/// If one wishes to construct their own [`Orchestrator`], they may do so via
/// [`Orchestrator::builder`]; [`Orchestrator::from_settings`] builds one from the
/// process environment (storage base directory, tick interval, queue URLs)
///
/// # Usage Note(s)
/// Construct it once at program start and pass it around explicitly; there is no
/// process-global instance. All public operations are safe to call concurrently, the
/// internal locks serialize state changes. Call [`Orchestrator::bootstrap`] before
/// anything else so the durable schedule set is loaded
///
/// # Example
/// ```ignore
/// let orchestrator = Orchestrator::builder().layout(layout).build();
/// orchestrator.bootstrap().await?;
///
/// let id = orchestrator
///     .add(ScheduleSpec::builder()
///         .pipeline_ref(PipelineRef::from_raw("warehouse-load"))
///         .cron_expression(CronExpression::parse("0 8 * * *")?)
///         .build())
///     .await?;
///
/// orchestrator.start_tick_loop(None, true).await;
/// ```
///
/// # See Also
/// - [`Scheduler`]
/// - [`OrchestratorConfig`]
pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    layout: StorageLayout,
    clock: Arc<dyn SchedulerClock>,
    tick_interval: Duration,
    tick_loop: Mutex<Option<TickLoopHandle>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("layout", &self.layout)
            .field("tick_interval", &self.tick_interval)
            .finish()
    }
}

impl Orchestrator {
    /// Constructs an orchestrator builder. Which is used for supplying the storage
    /// layout, engine, clock and optional composites to then construct an
    /// [`Orchestrator`]
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfig::builder()
    }

    /// Builds an orchestrator from resolved process [`Settings`]: the storage layout
    /// is created, and the filesystem queue is wired up when a broker URL is present
    pub fn from_settings(settings: &Settings, engine: Arc<dyn PipelineEngine>) -> Result<Self> {
        settings.layout.ensure()?;
        let queue: Option<Arc<dyn TaskQueue>> = match &settings.broker_url {
            Some(url) => {
                let broker_dir = Settings::url_as_path(url);
                let results_dir = settings
                    .result_backend_url
                    .as_deref()
                    .map(Settings::url_as_path)
                    .unwrap_or_else(|| settings.layout.results_dir());
                Some(Arc::new(FileTaskQueue::open(broker_dir, results_dir)?))
            }
            None => None,
        };
        let config = OrchestratorConfig {
            layout: settings.layout.clone(),
            engine,
            clock: Arc::new(crate::clock::SystemClock),
            catalog: None,
            queue,
            dispatch_async: true,
            observers: Vec::new(),
            tick_interval: settings.tick_interval,
        };
        Ok(config.into())
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Loads the durable schedule set into memory. Call once before anything else
    pub async fn bootstrap(&self) -> Result<usize> {
        self.layout.ensure()?;
        self.scheduler.load_schedules().await
    }

    // ------------------------------------------------------------------
    // Schedule CRUD
    // ------------------------------------------------------------------

    /// Registers a new schedule and returns its id. The schedule is durable before
    /// this returns
    pub async fn add(&self, spec: ScheduleSpec) -> Result<String> {
        let now = self.clock.now().await;
        let schedule = ScheduleConfig::from_spec(spec, now)?;
        self.scheduler.reject_cycles(&schedule.id, &schedule.dependencies).await?;
        self.scheduler.insert_schedule(schedule).await
    }

    /// Applies a partial update; the cron expression is re-validated by construction
    /// and `next_run` recomputed only when it changed
    pub async fn update(&self, id: &str, update: ScheduleUpdate) -> Result<ScheduleConfig> {
        self.scheduler.apply_update(id, update).await
    }

    /// Removes a schedule. History and running executions are untouched
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.scheduler.remove_schedule(id).await
    }

    pub async fn get(&self, id: &str) -> Result<ScheduleConfig> {
        self.scheduler
            .get_schedule(id)
            .await
            .ok_or_else(|| OrchestratorError::ScheduleNotFound(id.to_string()))
    }

    /// The whole schedule set, in id order
    pub async fn list(&self) -> Vec<ScheduleConfig> {
        self.scheduler.list_schedules().await
    }

    /// Adds a dependency edge with cycle prevention
    pub async fn add_dependency(&self, id: &str, dep_id: &str) -> Result<()> {
        self.scheduler.add_dependency(id, dep_id).await
    }

    pub async fn remove_dependency(&self, id: &str, dep_id: &str) -> Result<()> {
        self.scheduler.remove_dependency(id, dep_id).await
    }

    // ------------------------------------------------------------------
    // Runs, status, cancellation
    // ------------------------------------------------------------------

    /// Dispatches a schedule on demand (trigger MANUAL), bypassing the dependency
    /// gate and leaving `next_run` untouched. Returns the execution id
    pub async fn run(&self, id: &str, async_execution: bool) -> Result<String> {
        self.scheduler
            .run_now(id, TriggerKind::Manual, async_execution)
            .await
    }

    /// Same as [`Orchestrator::run`] but stamped with the caller's trigger, which is
    /// what the external API face uses
    pub async fn run_with_trigger(
        &self,
        id: &str,
        trigger: TriggerKind,
        async_execution: bool,
    ) -> Result<String> {
        self.scheduler.run_now(id, trigger, async_execution).await
    }

    /// Execution summary by execution id or queued task handle
    pub async fn status(&self, id_or_handle: &str) -> Result<ExecutionRecord> {
        self.scheduler.execution_status(id_or_handle).await
    }

    /// Durable history, filtered, newest first
    pub async fn executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        ExecutionStore::new(self.layout.executions_dir()).list(filter).await
    }

    /// Best-effort cancellation of an in-flight execution
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        self.scheduler.cancel_execution(execution_id).await
    }

    // ------------------------------------------------------------------
    // Tick loop
    // ------------------------------------------------------------------

    /// One tick right now. With `force`, every enabled schedule's `next_run` is
    /// pushed into the past first so they all fire
    pub async fn run_once(&self, force: bool) -> TickSummary {
        let now = self.clock.now().await;
        if force {
            self.scheduler.force_all_due(now).await;
        }
        self.scheduler.tick_at(now).await
    }

    /// Starts the background tick loop. Does nothing when it is already running.
    /// With `defer_first` the first tick happens one interval after start rather
    /// than immediately
    pub async fn start_tick_loop(&self, interval: Option<Duration>, defer_first: bool) {
        let mut guard = self.tick_loop.lock().await;
        if guard.is_some() {
            warn!("tick loop already running");
            return;
        }
        let interval = interval.unwrap_or(self.tick_interval);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = self.scheduler.clone();
        let clock = self.clock.clone();
        info!(interval = ?interval, defer_first, "tick loop starting");
        let task = tokio::spawn(async move {
            if defer_first {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        info!("tick loop stopped before its first tick");
                        return;
                    }
                    _ = clock.idle(interval) => {}
                }
            }
            loop {
                // The tick itself is never interrupted; a stop request takes
                // effect at the next boundary.
                scheduler.tick().await;
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = clock.idle(interval) => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
            }
            info!("tick loop stopped");
        });
        *guard = Some(TickLoopHandle { task, stop: stop_tx });
    }

    /// Signals the tick loop to stop and waits for it to finish its current tick
    pub async fn stop_tick_loop(&self) {
        let handle = self.tick_loop.lock().await.take();
        let Some(handle) = handle else {
            warn!("tick loop is not running");
            return;
        };
        let _ = handle.stop.send(true);
        if let Err(e) = handle.task.await {
            error!(error = %e, "tick loop task did not shut down cleanly");
        }
    }

    pub async fn tick_loop_running(&self) -> bool {
        self.tick_loop.lock().await.is_some()
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Brings the local schedule set into agreement with an external catalog:
    /// enabled catalog entries missing locally are added (keeping the catalog's
    /// ids), local schedules missing from the catalog are removed, and common ids
    /// are updated when the catalog side is newer. Idempotent, and safe to run while
    /// the tick loop is active
    pub async fn reconcile(&self, catalog: &dyn ScheduleCatalog) -> Result<ReconcileSummary> {
        let entries = catalog.entries().await?;
        let now = self.clock.now().await;
        let local = self.scheduler.list_schedules().await;
        let local_ids: std::collections::HashSet<String> =
            local.iter().map(|s| s.id.clone()).collect();
        let catalog_ids: std::collections::HashSet<String> =
            entries.iter().map(|e| e.id.clone()).collect();

        let mut summary = ReconcileSummary::default();

        for entry in &entries {
            if !local_ids.contains(&entry.id) {
                if !entry.enabled {
                    continue;
                }
                let schedule = entry.materialize(now)?;
                self.scheduler.reject_cycles(&schedule.id, &schedule.dependencies).await?;
                self.scheduler.insert_schedule(schedule).await?;
                summary.added += 1;
            }
        }

        for schedule in &local {
            if !catalog_ids.contains(&schedule.id) {
                self.scheduler.remove_schedule(&schedule.id).await?;
                summary.removed += 1;
            }
        }

        for entry in &entries {
            let Some(existing) = local.iter().find(|s| s.id == entry.id) else {
                continue;
            };
            if entry.updated_at > existing.updated_at {
                // Adopt the catalog's fields AND its timestamp, so a repeated pass
                // with the same catalog converges to a no-op.
                let mut updated = existing.clone();
                updated.pipeline_ref = entry.pipeline_ref.clone();
                let cron_changed = entry.cron_expression != updated.cron_expression;
                updated.cron_expression = entry.cron_expression.clone();
                updated.enabled = entry.enabled;
                updated.dependencies = entry.dependencies.clone();
                updated.max_retries = entry.max_retries;
                updated.retry_delay_seconds = entry.retry_delay_seconds;
                updated.timeout_seconds = entry.timeout_seconds;
                updated.updated_at = entry.updated_at;
                if cron_changed {
                    updated.advance_next_run(now)?;
                }
                self.scheduler.reject_cycles(&updated.id, &updated.dependencies).await?;
                self.scheduler.insert_schedule(updated).await?;
                summary.updated += 1;
            }
        }

        if !summary.is_noop() {
            info!(
                added = summary.added,
                removed = summary.removed,
                updated = summary.updated,
                "reconciled against external catalog"
            );
        }
        Ok(summary)
    }
}
