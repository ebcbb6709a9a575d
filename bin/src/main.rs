use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use pipewright::config::{Settings, SchedulerProcessState};
use pipewright::cron::CronExpression;
use pipewright::orchestrator::Orchestrator;
use pipewright::queue::FileTaskQueue;
use pipewright::runner::{CancelToken, NoopEngine, PipelineRunner};
use pipewright::schedule::{PipelineRef, ScheduleSpec, ScheduleUpdate};
use pipewright::store::ExecutionStore;
use pipewright::worker::Worker;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(about = "Data-pipeline scheduling and orchestration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage scheduled pipelines
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Control the scheduler process
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommands,
    },
    /// Run a queue worker
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Register a pipeline on a cron schedule
    Add {
        /// Path to a pipeline definition document, or a catalog pipeline id
        pipeline_ref: String,

        /// 5-field cron expression, e.g. "0 8 * * *"
        #[arg(long)]
        cron: String,

        /// Register the schedule enabled (the default)
        #[arg(long, conflicts_with = "disabled")]
        enabled: bool,

        /// Register the schedule disabled
        #[arg(long)]
        disabled: bool,

        /// Maximum retry attempts per failed run
        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        /// Seconds between retry attempts
        #[arg(long, default_value_t = 300)]
        retry_delay: u64,

        /// Schedule id this schedule depends on (repeatable)
        #[arg(long = "dependency")]
        dependencies: Vec<String>,

        /// Per-run timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List registered schedules
    List,
    /// Update fields of a schedule
    Update {
        id: String,

        #[arg(long)]
        cron: Option<String>,

        #[arg(long, conflicts_with = "disabled")]
        enabled: bool,

        #[arg(long)]
        disabled: bool,

        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long)]
        retry_delay: Option<u64>,
    },
    /// Delete a schedule
    Delete {
        id: String,

        /// Actually delete; without it nothing happens
        #[arg(long)]
        confirm: bool,
    },
    /// Run a schedule's pipeline immediately
    Run {
        id: String,

        /// Submit to the task queue instead of running in-process
        #[arg(long = "async")]
        async_execution: bool,
    },
}

#[derive(Subcommand)]
enum SchedulerCommands {
    /// Run the scheduler loop
    Start {
        /// Tick interval in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Detach into the background
        #[arg(long)]
        daemon: bool,
    },
    /// Ask a running scheduler to stop at its next tick boundary
    Stop,
    /// Report on the scheduler process and schedule set
    Status,
    /// Perform exactly one tick
    RunOnce {
        /// Push every enabled schedule's next run into the past first, so all fire
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Consume the task queue until interrupted
    Start {
        /// Seconds between polls of an empty queue
        #[arg(long, default_value_t = 5)]
        poll_interval: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env();
    match cli.command {
        Commands::Schedule { command } => schedule_command(&settings, command).await,
        Commands::Scheduler { command } => scheduler_command(&settings, command).await,
        Commands::Worker { command } => worker_command(&settings, command).await,
    }
}

async fn open_orchestrator(settings: &Settings) -> anyhow::Result<Orchestrator> {
    let orchestrator = Orchestrator::from_settings(settings, Arc::new(NoopEngine))
        .context("could not open the orchestrator state directory")?;
    orchestrator
        .bootstrap()
        .await
        .context("could not load the schedule set")?;
    Ok(orchestrator)
}

async fn schedule_command(settings: &Settings, command: ScheduleCommands) -> anyhow::Result<()> {
    let orchestrator = open_orchestrator(settings).await?;
    match command {
        ScheduleCommands::Add {
            pipeline_ref,
            cron,
            enabled: _,
            disabled,
            max_retries,
            retry_delay,
            dependencies,
            timeout,
        } => {
            let spec = ScheduleSpec::builder()
                .pipeline_ref(PipelineRef::from_raw(&pipeline_ref))
                .cron_expression(CronExpression::parse(&cron)?)
                .enabled(!disabled)
                .dependencies(dependencies)
                .max_retries(max_retries)
                .retry_delay_seconds(retry_delay)
                .timeout_seconds(timeout)
                .build();
            let id = orchestrator.add(spec).await?;
            println!("{id}");
        }
        ScheduleCommands::List => {
            let schedules = orchestrator.list().await;
            if schedules.is_empty() {
                println!("no schedules registered");
                return Ok(());
            }
            println!(
                "{:<38} {:<28} {:<16} {:<8} {:<20} {}",
                "ID", "PIPELINE", "CRON", "ENABLED", "NEXT RUN", "LAST STATUS"
            );
            for schedule in schedules {
                let last = schedule
                    .last_run_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<28} {:<16} {:<8} {:<20} {}",
                    schedule.id,
                    truncate(&schedule.pipeline_ref.as_display_string(), 28),
                    schedule.cron_expression,
                    schedule.enabled,
                    schedule.next_run.format("%Y-%m-%d %H:%M:%S"),
                    last
                );
            }
        }
        ScheduleCommands::Update {
            id,
            cron,
            enabled,
            disabled,
            max_retries,
            retry_delay,
        } => {
            let cron_expression = cron.as_deref().map(CronExpression::parse).transpose()?;
            let enabled = match (enabled, disabled) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let update = ScheduleUpdate::builder()
                .cron_expression(cron_expression)
                .enabled(enabled)
                .max_retries(max_retries)
                .retry_delay_seconds(retry_delay)
                .build();
            if update.is_empty() {
                bail!("nothing to update: pass at least one of --cron, --enabled/--disabled, --max-retries, --retry-delay");
            }
            let schedule = orchestrator.update(&id, update).await?;
            println!("updated {} (next run {})", schedule.id, schedule.next_run.format("%Y-%m-%d %H:%M:%S"));
        }
        ScheduleCommands::Delete { id, confirm } => {
            if !confirm {
                bail!("refusing to delete schedule `{id}` without --confirm");
            }
            if orchestrator.remove(&id).await? {
                println!("deleted {id}");
            } else {
                bail!("schedule `{id}` not found");
            }
        }
        ScheduleCommands::Run { id, async_execution } => {
            let execution_id = orchestrator.run(&id, async_execution).await?;
            println!("{execution_id}");
            if !async_execution {
                let record = orchestrator.status(&execution_id).await?;
                println!("status: {}", record.status);
            }
        }
    }
    Ok(())
}

async fn scheduler_command(settings: &Settings, command: SchedulerCommands) -> anyhow::Result<()> {
    match command {
        SchedulerCommands::Start { interval, daemon } => {
            if daemon {
                return spawn_detached(interval);
            }
            let orchestrator = open_orchestrator(settings).await?;
            let layout = orchestrator.layout().clone();
            if SchedulerProcessState::read(&layout)?.is_some()
                && !layout.scheduler_stop_file().exists()
            {
                bail!("a scheduler already appears to be running (scheduler.json present); run `pipewright scheduler stop` first");
            }
            SchedulerProcessState::clear(&layout);

            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or(settings.tick_interval);
            SchedulerProcessState {
                pid: std::process::id(),
                interval_seconds: interval.as_secs(),
                started_at: chrono::Local::now(),
            }
            .write(&layout)?;

            orchestrator.start_tick_loop(Some(interval), true).await;
            info!(interval = ?interval, "scheduler running; stop with ctrl-c or `pipewright scheduler stop`");

            let stop_file = layout.scheduler_stop_file();
            loop {
                if stop_file.exists() {
                    info!("stop requested through the control file");
                    break;
                }
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupt received");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            orchestrator.stop_tick_loop().await;
            SchedulerProcessState::clear(&layout);
        }
        SchedulerCommands::Stop => {
            let layout = settings.layout.clone();
            let Some(state) = SchedulerProcessState::read(&layout)? else {
                bail!("no scheduler is running");
            };
            std::fs::write(layout.scheduler_stop_file(), b"")
                .context("could not write the stop marker")?;
            println!("stop requested for scheduler pid {}", state.pid);
        }
        SchedulerCommands::Status => {
            let orchestrator = open_orchestrator(settings).await?;
            let layout = orchestrator.layout().clone();
            match SchedulerProcessState::read(&layout)? {
                Some(state) => {
                    let alive = process_alive(state.pid);
                    println!(
                        "scheduler: pid {} ({}), interval {}s, started {}",
                        state.pid,
                        if alive { "alive" } else { "stale" },
                        state.interval_seconds,
                        state.started_at.format("%Y-%m-%d %H:%M:%S"),
                    );
                    if layout.scheduler_stop_file().exists() {
                        println!("stop: requested, pending next tick boundary");
                    }
                }
                None => println!("scheduler: not running"),
            }
            let schedules = orchestrator.list().await;
            let enabled = schedules.iter().filter(|s| s.enabled).count();
            println!("schedules: {} registered, {} enabled", schedules.len(), enabled);
            if let Some(soonest) = schedules
                .iter()
                .filter(|s| s.enabled)
                .min_by_key(|s| s.next_run)
            {
                println!(
                    "next fire: {} at {}",
                    soonest.id,
                    soonest.next_run.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        SchedulerCommands::RunOnce { force } => {
            let orchestrator = open_orchestrator(settings).await?;
            let summary = orchestrator.run_once(force).await;
            println!(
                "fired {}, deferred {}, retried {}",
                summary.fired, summary.deferred, summary.retried
            );
        }
    }
    Ok(())
}

async fn worker_command(settings: &Settings, command: WorkerCommands) -> anyhow::Result<()> {
    match command {
        WorkerCommands::Start { poll_interval } => {
            let Some(broker_url) = &settings.broker_url else {
                bail!("BROKER_URL is not configured; the worker has no queue to consume");
            };
            settings.layout.ensure()?;
            let results_dir = settings
                .result_backend_url
                .as_deref()
                .map(Settings::url_as_path)
                .unwrap_or_else(|| settings.layout.results_dir());
            let queue = FileTaskQueue::open(Settings::url_as_path(broker_url), results_dir)?;
            let clock: Arc<pipewright::clock::SystemClock> =
                Arc::new(pipewright::clock::SystemClock);
            let runner = PipelineRunner::builder()
                .engine(Arc::new(NoopEngine))
                .clock(clock.clone())
                .logs_dir(Some(settings.layout.logs_dir()))
                .build();
            let worker = Worker::builder()
                .queue(queue)
                .runner(runner)
                .executions(ExecutionStore::open(settings.layout.executions_dir())?)
                .clock(clock)
                .poll_interval(Duration::from_secs(poll_interval))
                .build();

            let shutdown = CancelToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                }
            });
            worker.run(shutdown).await;
        }
    }
    Ok(())
}

/// Respawns the CLI as a detached background scheduler and returns immediately
fn spawn_detached(interval: Option<u64>) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("could not locate the current executable")?;
    let mut command = std::process::Command::new(exe);
    command.args(["scheduler", "start"]);
    if let Some(interval) = interval {
        command.args(["--interval", &interval.to_string()]);
    }
    let child = command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("could not spawn the background scheduler")?;
    println!("scheduler started in the background (pid {})", child.id());
    Ok(())
}

fn process_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: Vec<char> = s.chars().collect();
    let tail: String = kept[kept.len() - (max - 3)..].iter().collect();
    format!("...{tail}")
}
