pub mod execution_store;
pub mod schedule_store;

pub use execution_store::{ExecutionFilter, ExecutionStore};
pub use schedule_store::ScheduleStore;

use crate::errors::{OrchestratorError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Serializes `value` as pretty JSON and replaces `path` atomically: the document is
/// written to a temporary sibling first and then renamed over the target, so readers
/// observe either the old document or the new one, never a torn write
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value).map_err(|e| {
        OrchestratorError::CorruptDocument {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &payload)
        .await
        .map_err(|e| OrchestratorError::storage(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| OrchestratorError::storage(path, e))?;
    Ok(())
}

/// Reads and decodes a JSON document, mapping undecodable content to
/// [`OrchestratorError::CorruptDocument`] so loaders can skip it deliberately
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| OrchestratorError::storage(path, e))?;
    serde_json::from_slice(&raw).map_err(|e| OrchestratorError::CorruptDocument {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
