use crate::cron::CronExpression;
use crate::errors::{OrchestratorError, Result};
use crate::execution::ExecutionStatus;
use chrono::{DateTime, Local};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Default retry budget applied when a schedule does not specify one
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default delay between retry attempts, in seconds
pub const DEFAULT_RETRY_DELAY_SECONDS: u64 = 300;

/// [`PipelineRef`] names the pipeline a schedule fires: either a filesystem path to a
/// pipeline-definition document, or a bare pipeline id resolved through the catalog
///
/// # Implementation Detail(s)
/// On disk the reference is the canonical plain string of the persisted schedule shape.
/// The variant is discriminated exactly once, when the string is decoded: anything with
/// a path separator or a document extension is a path, everything else is an id. The
/// filesystem is never probed to tell the two apart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineRef {
    /// A path to a pipeline-definition document (YAML or JSON)
    Path(PathBuf),
    /// A bare pipeline id, resolved through the pipeline catalog
    Id(String),
}

impl PipelineRef {
    /// Discriminates a raw reference string into its variant
    pub fn from_raw(raw: &str) -> Self {
        let looks_like_path = raw.contains('/')
            || raw.contains('\\')
            || raw.ends_with(".yml")
            || raw.ends_with(".yaml")
            || raw.ends_with(".json");
        if looks_like_path {
            PipelineRef::Path(PathBuf::from(raw))
        } else {
            PipelineRef::Id(raw.to_string())
        }
    }

    pub fn as_display_string(&self) -> String {
        match self {
            PipelineRef::Path(path) => path.display().to_string(),
            PipelineRef::Id(id) => id.clone(),
        }
    }
}

impl fmt::Display for PipelineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_display_string())
    }
}

impl Serialize for PipelineRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_display_string())
    }
}

impl<'de> Deserialize<'de> for PipelineRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Err(D::Error::custom("pipeline_ref must not be empty"));
        }
        Ok(PipelineRef::from_raw(&raw))
    }
}

/// [`ScheduleSpec`] is the request shape for registering a new schedule, a typed builder
/// carrying the caller-facing knobs with their documented defaults. By itself it is not
/// as useful, it exists to be handed to
/// [`Orchestrator::add`](crate::orchestrator::Orchestrator::add)
///
/// # Example
/// ```ignore
/// let spec = ScheduleSpec::builder()
///     .pipeline_ref(PipelineRef::from_raw("warehouse-load"))
///     .cron_expression(CronExpression::parse("0 8 * * *")?)
///     .dependencies(vec![upstream_id])
///     .build();
/// let schedule_id = orchestrator.add(spec).await?;
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct ScheduleSpec {
    pub pipeline_ref: PipelineRef,
    pub cron_expression: CronExpression,

    /// Whether the tick loop considers the schedule at all. A disabled schedule still
    /// tracks a `next_run`
    #[builder(default = true)]
    pub enabled: bool,

    /// Schedule ids this schedule waits on (set semantics, duplicates rejected)
    #[builder(default)]
    pub dependencies: Vec<String>,

    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    #[builder(default = DEFAULT_RETRY_DELAY_SECONDS)]
    pub retry_delay_seconds: u64,

    /// Optional per-run timeout. A run exceeding it is recorded FAILED with a
    /// distinguishable message
    #[builder(default)]
    pub timeout_seconds: Option<u64>,
}

/// [`ScheduleConfig`] is one scheduled pipeline: the durable unit the schedule store
/// persists and the tick loop walks. Every mutation is flushed to disk before the
/// mutating call returns to its caller
///
/// # Invariant(s)
/// - `cron_expression` is valid at all times (enforced by [`CronExpression`])
/// - `next_run` is strictly in the future relative to the instant it was computed at
/// - `dependencies` never contains the schedule's own id nor duplicates
///
/// # See Also
/// - [`ScheduleSpec`]
/// - [`crate::store::ScheduleStore`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    pub id: String,
    pub pipeline_ref: PipelineRef,
    pub cron_expression: CronExpression,
    pub enabled: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    pub next_run: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<ExecutionStatus>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

impl ScheduleConfig {
    /// Materializes a schedule from a registration request, stamping a fresh id and
    /// computing the first `next_run` strictly after `now`
    pub fn from_spec(spec: ScheduleSpec, now: DateTime<Local>) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        validate_dependencies(&id, &spec.dependencies)?;
        let next_run = spec.cron_expression.next_after(now)?;
        Ok(Self {
            id,
            pipeline_ref: spec.pipeline_ref,
            cron_expression: spec.cron_expression,
            enabled: spec.enabled,
            dependencies: spec.dependencies,
            max_retries: spec.max_retries,
            retry_delay_seconds: spec.retry_delay_seconds,
            timeout_seconds: spec.timeout_seconds,
            next_run,
            last_run_time: None,
            last_run_status: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether the tick loop should consider firing this schedule at `now`
    pub fn is_due(&self, now: DateTime<Local>) -> bool {
        self.enabled && self.next_run <= now
    }

    /// Recomputes `next_run` strictly after `now`. Called by the scheduler after every
    /// fire, successful or not
    pub fn advance_next_run(&mut self, now: DateTime<Local>) -> Result<()> {
        self.next_run = self.cron_expression.next_after(now)?;
        Ok(())
    }
}

/// [`ScheduleUpdate`] is the partial-mutation shape accepted by
/// [`Orchestrator::update`](crate::orchestrator::Orchestrator::update). Unset fields are
/// left untouched; `next_run` is recomputed only when the cron expression actually
/// changes value
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct ScheduleUpdate {
    #[builder(default)]
    pub cron_expression: Option<CronExpression>,
    #[builder(default)]
    pub enabled: Option<bool>,
    #[builder(default)]
    pub dependencies: Option<Vec<String>>,
    #[builder(default)]
    pub max_retries: Option<u32>,
    #[builder(default)]
    pub retry_delay_seconds: Option<u64>,
    #[builder(default)]
    pub timeout_seconds: Option<Option<u64>>,
}

impl ScheduleUpdate {
    pub fn is_empty(&self) -> bool {
        self.cron_expression.is_none()
            && self.enabled.is_none()
            && self.dependencies.is_none()
            && self.max_retries.is_none()
            && self.retry_delay_seconds.is_none()
            && self.timeout_seconds.is_none()
    }
}

/// Rejects a dependency list that names the schedule itself or repeats an entry
pub(crate) fn validate_dependencies(id: &str, dependencies: &[String]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for dep in dependencies {
        if dep == id {
            return Err(OrchestratorError::Validation(format!(
                "schedule `{id}` cannot depend on itself"
            )));
        }
        if !seen.insert(dep.as_str()) {
            return Err(OrchestratorError::Validation(format!(
                "duplicate dependency `{dep}`"
            )));
        }
    }
    Ok(())
}
