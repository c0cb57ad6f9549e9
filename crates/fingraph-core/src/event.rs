use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ProgressKind {
    Started { tasks: Vec<String> },
    Completed,
    Failed { error: String },
}

/// A progress notification for one stage of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub transaction_id: String,
    pub stage: String,
    #[serde(flatten)]
    pub kind: ProgressKind,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(transaction_id: impl Into<String>, stage: impl Into<String>, kind: ProgressKind) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            stage: stage.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Completed,
    Failed,
}

/// One row of the execution order shown to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOrderEntry {
    pub stage: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: StageStatus,
}

impl ExecutionOrderEntry {
    pub fn start(stage: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            stage: stage.into(),
            start_time: at,
            end_time: None,
            status: StageStatus::Running,
        }
    }

    pub fn finish(&mut self, status: StageStatus, at: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(at);
    }
}
