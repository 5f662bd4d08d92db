use crate::ContractError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Name of the append-only observation log watched for new rows.
pub const RAW_SALES_STREAM: &str = "raw_sales";

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    #[default]
    Idle,
    Features,
    Training,
    Comparing,
    Monitoring,
    Done,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "IDLE",
            RunPhase::Features => "FEATURES",
            RunPhase::Training => "TRAINING",
            RunPhase::Comparing => "COMPARING",
            RunPhase::Monitoring => "MONITORING",
            RunPhase::Done => "DONE",
            RunPhase::Failed => "FAILED",
        }
    }

    /// Stage that follows this one on the success path.
    pub fn next(&self) -> Option<RunPhase> {
        match self {
            RunPhase::Idle => Some(RunPhase::Features),
            RunPhase::Features => Some(RunPhase::Training),
            RunPhase::Training => Some(RunPhase::Comparing),
            RunPhase::Comparing => Some(RunPhase::Monitoring),
            RunPhase::Monitoring => Some(RunPhase::Done),
            RunPhase::Done | RunPhase::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunPhase {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "IDLE" => Ok(RunPhase::Idle),
            "FEATURES" => Ok(RunPhase::Features),
            "TRAINING" => Ok(RunPhase::Training),
            "COMPARING" => Ok(RunPhase::Comparing),
            "MONITORING" => Ok(RunPhase::Monitoring),
            "DONE" => Ok(RunPhase::Done),
            "FAILED" => Ok(RunPhase::Failed),
            other => Err(ContractError::UnknownLabel {
                kind: "run phase",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(ContractError::UnknownLabel {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// One orchestrator execution, persisted once `phase` is DONE or FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub phase: RunPhase,
    pub status: RunStatus,
    pub records_processed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub trigger_position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_fingerprint: Option<String>,
    pub message: String,
}

impl PipelineRun {
    pub fn new_run_id() -> String {
        format!("run-{}", Uuid::new_v4())
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    Stream,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Stream => "STREAM",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "STREAM" => Ok(TriggerKind::Stream),
            other => Err(ContractError::UnknownLabel {
                kind: "trigger kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Records that the change detector fired and a run was started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerLogEntry {
    pub logged_at: DateTime<Utc>,
    pub run_id: String,
    pub trigger_kind: TriggerKind,
    pub new_rows: u64,
    pub from_position: i64,
    pub to_position: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_walk_the_success_path_in_order() {
        let mut phase = RunPhase::Idle;
        let mut visited = vec![phase];
        while let Some(next) = phase.next() {
            visited.push(next);
            phase = next;
        }
        assert_eq!(
            visited,
            vec![
                RunPhase::Idle,
                RunPhase::Features,
                RunPhase::Training,
                RunPhase::Comparing,
                RunPhase::Monitoring,
                RunPhase::Done,
            ]
        );
        assert!(RunPhase::Failed.is_terminal());
        assert!(RunPhase::Failed.next().is_none());
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(PipelineRun::new_run_id(), PipelineRun::new_run_id());
        assert!(PipelineRun::new_run_id().starts_with("run-"));
    }

    #[test]
    fn labels_parse_case_insensitively() {
        assert_eq!("monitoring".parse::<RunPhase>().expect("phase"), RunPhase::Monitoring);
        assert_eq!("Failed".parse::<RunStatus>().expect("status"), RunStatus::Failed);
        assert_eq!("stream".parse::<TriggerKind>().expect("kind"), TriggerKind::Stream);
        assert!("paused".parse::<RunPhase>().is_err());
    }
}
