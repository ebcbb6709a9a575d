use crate::cron::CronExpression;
use crate::errors::Result;
use crate::schedule::{PipelineRef, ScheduleConfig, validate_dependencies};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// [`CatalogEntry`] is one schedule as an external management face declares it. It
/// mirrors the mutable surface of [`ScheduleConfig`]; `updated_at` decides which side
/// wins when both have the schedule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
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
    pub updated_at: DateTime<Local>,
}

impl CatalogEntry {
    /// Materializes a local schedule from this entry, keeping the catalog's id so
    /// both sides keep talking about the same schedule
    pub(crate) fn materialize(&self, now: DateTime<Local>) -> Result<ScheduleConfig> {
        validate_dependencies(&self.id, &self.dependencies)?;
        let next_run = self.cron_expression.next_after(now)?;
        Ok(ScheduleConfig {
            id: self.id.clone(),
            pipeline_ref: self.pipeline_ref.clone(),
            cron_expression: self.cron_expression.clone(),
            enabled: self.enabled,
            dependencies: self.dependencies.clone(),
            max_retries: self.max_retries,
            retry_delay_seconds: self.retry_delay_seconds,
            timeout_seconds: self.timeout_seconds,
            next_run,
            last_run_time: None,
            last_run_status: None,
            created_at: now,
            updated_at: self.updated_at,
        })
    }
}

/// [`ScheduleCatalog`] is the seam to an external source of truth for which schedules
/// should exist (typically the datastore behind a management REST face). The
/// orchestrator periodically reconciles its local set against it; the core defines
/// only this enumeration interface
///
/// # See Also
/// - [`Orchestrator::reconcile`](crate::orchestrator::Orchestrator::reconcile)
#[async_trait]
pub trait ScheduleCatalog: Send + Sync {
    async fn entries(&self) -> Result<Vec<CatalogEntry>>;
}

/// What one reconciliation pass changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.updated == 0
    }
}
