use crate::errors::{OrchestratorError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the state base directory
pub const ENV_STORAGE_BASE_DIR: &str = "STORAGE_BASE_DIR";
/// Environment variable setting the tick interval (in seconds) on process start
pub const ENV_SCHEDULER_INTERVAL: &str = "SCHEDULER_INTERVAL_SECONDS";
/// Environment variable pointing at the queue broker (a spool directory or `file://` URL)
pub const ENV_BROKER_URL: &str = "BROKER_URL";
/// Environment variable pointing at the queued-task result backend
pub const ENV_RESULT_BACKEND_URL: &str = "RESULT_BACKEND_URL";
/// Environment variable seeding the initial admin username for the external API face
pub const ENV_ADMIN_USERNAME: &str = "ADMIN_USERNAME";
/// Environment variable seeding the initial admin password for the external API face
pub const ENV_ADMIN_PASSWORD: &str = "ADMIN_PASSWORD";

/// Name of the per-user state directory placed under the home directory when no
/// explicit base directory is configured
const DEFAULT_BASE_DIR_NAME: &str = ".dteg";
/// Tick interval applied when neither the caller nor the environment supplies one
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// [`StorageLayout`] maps the process-local base directory to the directory tree every
/// durable artifact of the orchestrator lives in. It is a pure path holder, nothing is
/// touched on disk until [`StorageLayout::ensure`] is called
///
/// # Constructor(s)
/// When constructing a [`StorageLayout`], one can use [`StorageLayout::new`] with an
/// explicit base directory, or [`StorageLayout::default_base`] to resolve the
/// conventional per-user location (honoring the `STORAGE_BASE_DIR` environment variable)
///
/// # See Also
/// - [`Settings`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    base: PathBuf,
}

impl StorageLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Resolves the conventional base directory: `STORAGE_BASE_DIR` when set, otherwise
    /// the `.dteg` directory under the user's home (falling back to the current directory
    /// when no home can be determined)
    pub fn default_base() -> Self {
        if let Ok(dir) = std::env::var(ENV_STORAGE_BASE_DIR) {
            return Self::new(dir);
        }
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(DEFAULT_BASE_DIR_NAME))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory holding one `<schedule_id>.json` per schedule
    pub fn schedules_dir(&self) -> PathBuf {
        self.base.join("schedules")
    }

    /// Directory holding one `<execution_id>.json` per execution record
    pub fn executions_dir(&self) -> PathBuf {
        self.base.join("executions")
    }

    /// Directory holding `<pipeline_id>.json` catalog documents
    pub fn pipelines_dir(&self) -> PathBuf {
        self.base.join("pipelines")
    }

    /// Directory holding `execution_<execution_id>.log` detailed log streams
    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Directory holding `<task_handle>.json` terminal results of queued tasks
    pub fn results_dir(&self) -> PathBuf {
        self.base.join("results")
    }

    /// Control file recording the running scheduler process
    pub fn scheduler_state_file(&self) -> PathBuf {
        self.base.join("scheduler.json")
    }

    /// Marker file a running scheduler honors at the next tick boundary
    pub fn scheduler_stop_file(&self) -> PathBuf {
        self.base.join("scheduler.stop")
    }

    /// Creates the whole directory tree. Safe to call repeatedly
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.base.clone(),
            self.schedules_dir(),
            self.executions_dir(),
            self.pipelines_dir(),
            self.logs_dir(),
            self.results_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| OrchestratorError::storage(&dir, e))?;
        }
        Ok(())
    }
}

/// Credentials seeded for the external management face. The core only recognizes and
/// carries them, it never consumes them itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSeed {
    pub username: String,
    pub password: String,
}

/// [`Settings`] is the process-level configuration of the orchestration core, resolved
/// once at startup from the environment and handed to whoever constructs the
/// [`Orchestrator`](crate::orchestrator::Orchestrator)
///
/// # Recognized environment
/// - `STORAGE_BASE_DIR` overrides the state base directory
/// - `SCHEDULER_INTERVAL_SECONDS` sets the tick interval
/// - `BROKER_URL` / `RESULT_BACKEND_URL` configure the distributed queue, absence
///   disables it and execution falls back in-process
/// - `ADMIN_USERNAME` / `ADMIN_PASSWORD` seed an initial admin for the external API
#[derive(Debug, Clone)]
pub struct Settings {
    pub layout: StorageLayout,
    pub tick_interval: Duration,
    pub broker_url: Option<String>,
    pub result_backend_url: Option<String>,
    pub admin_seed: Option<AdminSeed>,
}

impl Settings {
    /// Resolves settings from the process environment. Never fails: unparseable values
    /// fall back to defaults with a warning so a bad environment cannot keep the
    /// process from starting
    pub fn from_env() -> Self {
        let layout = StorageLayout::default_base();

        let tick_interval = match std::env::var(ENV_SCHEDULER_INTERVAL) {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    tracing::warn!(
                        value = %raw,
                        "ignoring unparseable {ENV_SCHEDULER_INTERVAL}, using default"
                    );
                    DEFAULT_TICK_INTERVAL
                }
            },
            Err(_) => DEFAULT_TICK_INTERVAL,
        };

        let admin_seed = match (
            std::env::var(ENV_ADMIN_USERNAME),
            std::env::var(ENV_ADMIN_PASSWORD),
        ) {
            (Ok(username), Ok(password)) => Some(AdminSeed { username, password }),
            _ => None,
        };

        Self {
            layout,
            tick_interval,
            broker_url: std::env::var(ENV_BROKER_URL).ok(),
            result_backend_url: std::env::var(ENV_RESULT_BACKEND_URL).ok(),
            admin_seed,
        }
    }

    /// Interprets a broker / result-backend URL as a local directory. Plain paths are
    /// taken verbatim, `file://` URLs are stripped of their scheme
    pub fn url_as_path(url: &str) -> PathBuf {
        match url.strip_prefix("file://") {
            Some(rest) => PathBuf::from(rest),
            None => PathBuf::from(url),
        }
    }
}

/// [`SchedulerProcessState`] is the control document a foreground scheduler process
/// records under the base directory (`scheduler.json`) so sibling CLI invocations can
/// report on it and request a stop. Removed on clean shutdown
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchedulerProcessState {
    pub pid: u32,
    pub interval_seconds: u64,
    pub started_at: chrono::DateTime<chrono::Local>,
}

impl SchedulerProcessState {
    pub fn write(&self, layout: &StorageLayout) -> Result<()> {
        let path = layout.scheduler_state_file();
        let payload = serde_json::to_vec_pretty(self).map_err(|e| {
            OrchestratorError::CorruptDocument {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        std::fs::write(&path, payload).map_err(|e| OrchestratorError::storage(&path, e))
    }

    pub fn read(layout: &StorageLayout) -> Result<Option<Self>> {
        let path = layout.scheduler_state_file();
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(OrchestratorError::storage(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| OrchestratorError::CorruptDocument {
                path,
                reason: e.to_string(),
            })
    }

    pub fn clear(layout: &StorageLayout) {
        let _ = std::fs::remove_file(layout.scheduler_state_file());
        let _ = std::fs::remove_file(layout.scheduler_stop_file());
    }
}
