use crate::errors::{OrchestratorError, Result};
use crate::execution::{ExecutionRecord, ExecutionStatus};
use crate::store::{read_json, write_json_atomic};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::warn;
use typed_builder::TypedBuilder;

/// [`ExecutionFilter`] narrows an [`ExecutionStore::list`] query. Every unset field
/// matches everything, so the default filter returns the full history
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct ExecutionFilter {
    #[builder(default)]
    pub pipeline_id: Option<String>,
    #[builder(default)]
    pub schedule_id: Option<String>,
    #[builder(default)]
    pub status: Option<ExecutionStatus>,
    #[builder(default)]
    pub started_after: Option<DateTime<Local>>,
    #[builder(default)]
    pub started_before: Option<DateTime<Local>>,
    #[builder(default)]
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(pipeline_id) = &self.pipeline_id
            && record.pipeline_id != *pipeline_id
        {
            return false;
        }
        if let Some(schedule_id) = &self.schedule_id
            && record.schedule_id != *schedule_id
        {
            return false;
        }
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }
        if let Some(after) = self.started_after
            && record.start_time < after
        {
            return false;
        }
        if let Some(before) = self.started_before
            && record.start_time > before
        {
            return false;
        }
        true
    }
}

/// [`ExecutionStore`] is the append-style durable history of every
/// [`ExecutionRecord`], one `<execution_id>.json` document per record
///
/// # Implementation Detail(s)
/// There is no secondary index; queries scan the directory. The expected history sizes
/// (tens of thousands of records) keep a scan well inside interactive latency, and the
/// one-file-per-record layout means `put` is naturally idempotent by id
///
/// # See Also
/// - [`ExecutionRecord`]
/// - [`crate::store::ScheduleStore`]
#[derive(Debug, Clone)]
pub struct ExecutionStore {
    dir: PathBuf,
}

impl ExecutionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| OrchestratorError::storage(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Creates or replaces a record (idempotent by id), atomically
    pub async fn put(&self, record: &ExecutionRecord) -> Result<()> {
        write_json_atomic(&self.path_of(&record.id), record).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let path = self.path_of(id);
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

    /// Scans the history, newest first (by start time), applying the filter and its
    /// optional limit. Undecodable documents are skipped with a warning
    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(OrchestratorError::storage(&self.dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrchestratorError::storage(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<ExecutionRecord>(&path).await {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable execution document");
                }
            }
        }
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// The most recent terminal record for a schedule, the quantity the dependency
    /// gate is decided on
    pub async fn latest_terminal_for_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<Option<ExecutionRecord>> {
        let filter = ExecutionFilter::builder()
            .schedule_id(Some(schedule_id.to_string()))
            .build();
        Ok(self
            .list(&filter)
            .await?
            .into_iter()
            .find(|record| record.is_terminal()))
    }
}
