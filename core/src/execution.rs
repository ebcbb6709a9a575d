use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// [`ExecutionStatus`] is the state of one attempted pipeline run. The terminal states
/// are [`ExecutionStatus::Success`], [`ExecutionStatus::Failed`] and
/// [`ExecutionStatus::Cancelled`]; a record in any of those never transitions again
///
/// # State machine
/// ```text
/// PENDING -> RUNNING -> SUCCESS
///                    -> FAILED ---(retries left)---> RETRYING (spawns a fresh record)
///                    -> CANCELLED
/// PENDING ----------(soft cancel)-----------------> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Retrying,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether no further transition can happen from this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Retrying => "RETRYING",
            ExecutionStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// What caused an execution to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    /// Fired by the tick loop on a cron window
    Cron,
    /// Requested by a human through the CLI
    Manual,
    /// Requested by the external management face
    Api,
    /// Fired on behalf of a dependent pipeline
    Dependency,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::Cron => "CRON",
            TriggerKind::Manual => "MANUAL",
            TriggerKind::Api => "API",
            TriggerKind::Dependency => "DEPENDENCY",
        };
        f.write_str(s)
    }
}

/// [`ExecutionRecord`] is the durable trace of one attempted run. It is created when the
/// scheduler decides to fire (or a manual run is requested), persisted immediately, and
/// re-persisted exactly once more when it reaches a terminal state. The schedule and
/// pipeline ids are value copies, not foreign keys, so history survives schedule deletion
///
/// # Invariant(s)
/// - a terminal status implies `end_time` is set and `end_time >= start_time`
/// - `retry_count` never exceeds the owning schedule's `max_retries`
/// - `logs` is append-only; once terminal the whole record is immutable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub id: String,
    pub schedule_id: String,
    pub pipeline_id: String,
    pub status: ExecutionStatus,
    pub trigger: TriggerKind,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    /// Links the attempts of one retry chain: the id of the chain's original record.
    /// Absent on first attempts so the canonical record shape stays untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

impl ExecutionRecord {
    /// Creates a running record for a fresh first attempt
    pub fn started(
        schedule_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        trigger: TriggerKind,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            schedule_id: schedule_id.into(),
            pipeline_id: pipeline_id.into(),
            status: ExecutionStatus::Running,
            trigger,
            start_time: now,
            end_time: None,
            retry_count: 0,
            error_message: None,
            logs: Vec::new(),
            chain_id: None,
        }
    }

    /// Creates the next attempt of a retry chain. The chain id is the original
    /// record's id, carried unchanged across every follow-up
    pub fn retry_attempt(&self, retry_count: u32, now: DateTime<Local>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            schedule_id: self.schedule_id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            status: ExecutionStatus::Running,
            trigger: self.trigger,
            start_time: now,
            end_time: None,
            retry_count,
            error_message: None,
            logs: Vec::new(),
            chain_id: Some(self.chain_id.clone().unwrap_or_else(|| self.id.clone())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Marks the run finished, successfully or not
    pub fn complete(&mut self, success: bool, error_message: Option<String>, now: DateTime<Local>) {
        self.status = if success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        self.end_time = Some(now);
        self.error_message = error_message;
    }

    /// Marks the attempt failed but superseded by a scheduled follow-up attempt
    pub fn mark_retrying(&mut self, error_message: String, now: DateTime<Local>) {
        self.status = ExecutionStatus::Retrying;
        self.end_time = Some(now);
        self.error_message = Some(error_message);
    }

    /// Marks the run cancelled by an explicit caller request
    pub fn mark_cancelled(&mut self, now: DateTime<Local>) {
        self.status = ExecutionStatus::Cancelled;
        self.end_time = Some(now);
    }

    pub fn append_log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn terminal_states_carry_an_end_time() {
        let mut record = ExecutionRecord::started("s", "p", TriggerKind::Cron, noon());
        assert!(!record.is_terminal());
        record.complete(true, None, noon() + chrono::Duration::seconds(5));
        assert!(record.is_terminal());
        assert!(record.end_time.unwrap() >= record.start_time);
    }

    #[test]
    fn retry_attempts_share_one_chain_id() {
        let first = ExecutionRecord::started("s", "p", TriggerKind::Cron, noon());
        let second = first.retry_attempt(1, noon() + chrono::Duration::seconds(1));
        let third = second.retry_attempt(2, noon() + chrono::Duration::seconds(2));
        assert_eq!(second.chain_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(third.chain_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(third.retry_count, 2);
    }

    #[test]
    fn statuses_serialize_screaming() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Retrying).unwrap(),
            "\"RETRYING\""
        );
        assert_eq!(
            serde_json::to_string(&TriggerKind::Manual).unwrap(),
            "\"MANUAL\""
        );
    }

    #[test]
    fn record_round_trips_through_its_canonical_shape() {
        let mut record = ExecutionRecord::started("sched", "pipe", TriggerKind::Api, noon());
        record.append_log("extract: 120 rows");
        record.complete(false, Some("loader refused".into()), noon());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["trigger"], "API");
        assert!(json.get("chain_id").is_none());
        let back: ExecutionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
