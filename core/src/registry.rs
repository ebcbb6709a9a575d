use crate::errors::{OrchestratorError, Result};
use crate::schedule::PipelineRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// [`PipelineConfig`] is the executable definition of one pipeline, as far as the
/// orchestration core cares: a stable id plus the opaque document the external ETL
/// engine interprets. The core never looks inside `document`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Everything else in the definition document, passed through untouched
    #[serde(flatten)]
    pub document: serde_json::Map<String, serde_json::Value>,
}

impl PipelineConfig {
    /// A minimal config carrying nothing but an id. Useful for hosts whose engine
    /// resolves the definition itself, and for tests
    pub fn bare(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            name: None,
            description: None,
            document: serde_json::Map::new(),
        }
    }
}

/// [`PipelineCatalog`] is the lookup seam for bare pipeline ids. The hosting
/// application decides where definitions actually live, the core only defines the
/// interface and ships a filesystem-backed implementation
///
/// # Trait Implementation(s)
/// - [`FilePipelineCatalog`] reads `<dir>/<pipeline_id>.json` documents
/// - ``()`` is the empty catalog which resolves nothing (used when a host only ever
///   schedules path references)
///
/// # See Also
/// - [`PipelineRegistry`]
#[async_trait]
pub trait PipelineCatalog: Send + Sync {
    async fn lookup(&self, pipeline_id: &str) -> Result<Option<PipelineConfig>>;
}

#[async_trait]
impl PipelineCatalog for () {
    async fn lookup(&self, _pipeline_id: &str) -> Result<Option<PipelineConfig>> {
        Ok(None)
    }
}

/// [`FilePipelineCatalog`] is the filesystem-backed implementation of
/// [`PipelineCatalog`], resolving `<pipeline_id>.json` documents inside one directory
#[derive(Debug, Clone)]
pub struct FilePipelineCatalog {
    dir: PathBuf,
}

impl FilePipelineCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PipelineCatalog for FilePipelineCatalog {
    async fn lookup(&self, pipeline_id: &str) -> Result<Option<PipelineConfig>> {
        let path = self.dir.join(format!("{pipeline_id}.json"));
        match crate::store::read_json::<PipelineConfig>(&path).await {
            Ok(config) => Ok(Some(config)),
            Err(OrchestratorError::Storage { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// [`PipelineRegistry`] turns a [`PipelineRef`] into an executable [`PipelineConfig`]:
/// path references are parsed from their definition document (YAML or JSON), bare ids
/// go through the configured [`PipelineCatalog`]. Anything that resolves to neither is
/// a `PIPELINE_NOT_FOUND` failure
#[derive(Clone)]
pub struct PipelineRegistry {
    catalog: Arc<dyn PipelineCatalog>,
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry").finish()
    }
}

impl PipelineRegistry {
    pub fn new(catalog: Arc<dyn PipelineCatalog>) -> Self {
        Self { catalog }
    }

    pub async fn resolve(&self, reference: &PipelineRef) -> Result<PipelineConfig> {
        match reference {
            PipelineRef::Path(path) => self.parse_document(path).await,
            PipelineRef::Id(id) => self
                .catalog
                .lookup(id)
                .await?
                .ok_or_else(|| OrchestratorError::PipelineNotFound(id.clone())),
        }
    }

    async fn parse_document(&self, path: &Path) -> Result<PipelineConfig> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrchestratorError::PipelineNotFound(
                    path.display().to_string(),
                ));
            }
            Err(e) => return Err(OrchestratorError::storage(path, e)),
        };
        // YAML is a superset of JSON, one parser covers both document flavors.
        serde_yaml::from_str(&raw).map_err(|e| OrchestratorError::CorruptDocument {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}
