use crate::errors::{OrchestratorError, Result};
use crate::schedule::ScheduleConfig;
use crate::store::{read_json, write_json_atomic};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// [`ScheduleStore`] is the durable home of every [`ScheduleConfig`], one
/// `<schedule_id>.json` document per schedule inside a designated directory
///
/// # Usage Note(s)
/// The store is safe for a single writer and any number of readers; two processes
/// writing the same id are coordinated one level up, through the orchestrator's
/// reconciliation. Writes are atomic (temporary sibling plus rename), and a corrupt
/// document found at load time is logged and skipped so the rest of the set still loads
///
/// # Constructor(s)
/// [`ScheduleStore::new`] wraps a directory path; [`ScheduleStore::open`] additionally
/// creates the directory
///
/// # See Also
/// - [`ScheduleConfig`]
/// - [`crate::store::ExecutionStore`]
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    dir: PathBuf,
}

impl ScheduleStore {
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

    /// Reads the whole schedule set once, at startup. Undecodable documents are
    /// skipped with a warning; everything else loads
    pub async fn load(&self) -> Result<BTreeMap<String, ScheduleConfig>> {
        let mut schedules = BTreeMap::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(schedules),
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
            match read_json::<ScheduleConfig>(&path).await {
                Ok(schedule) => {
                    schedules.insert(schedule.id.clone(), schedule);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable schedule document");
                }
            }
        }
        debug!(count = schedules.len(), dir = %self.dir.display(), "loaded schedule set");
        Ok(schedules)
    }

    /// Creates or replaces a schedule. The on-disk document is updated before this
    /// returns
    pub async fn put(&self, schedule: &ScheduleConfig) -> Result<()> {
        write_json_atomic(&self.path_of(&schedule.id), schedule).await
    }

    /// Removes a schedule document. Returns whether anything existed
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.path_of(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OrchestratorError::storage(&path, e)),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduleConfig>> {
        let path = self.path_of(id);
        match read_json::<ScheduleConfig>(&path).await {
            Ok(schedule) => Ok(Some(schedule)),
            Err(OrchestratorError::Storage { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Lists every decodable schedule, ordered by id
    pub async fn list(&self) -> Result<Vec<ScheduleConfig>> {
        Ok(self.load().await?.into_values().collect())
    }
}
