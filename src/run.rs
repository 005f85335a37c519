use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metrics read back from the tracker plus `deployed`. The key set depends
/// on what the notebook logs, so it stays a dynamic string-keyed map.
pub type Metrics = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Download,
    Validate,
    Execute,
    Register,
    Deploy,
}

impl PhaseName {
    pub const ALL: [PhaseName; 5] = [
        PhaseName::Download,
        PhaseName::Validate,
        PhaseName::Execute,
        PhaseName::Register,
        PhaseName::Deploy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseName::Download => "download",
            PhaseName::Validate => "validate",
            PhaseName::Execute => "execute",
            PhaseName::Register => "register",
            PhaseName::Deploy => "deploy",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Success => "success",
            PhaseStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: PhaseName,
    pub status: PhaseStatus,
    /// Time of the latest transition.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: String,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl PhaseRecord {
    pub fn pending(name: PhaseName, attempt: u32) -> Self {
        Self {
            name,
            status: PhaseStatus::Pending,
            timestamp: Utc::now(),
            started_at: None,
            finished_at: None,
            logs: String::new(),
            attempt,
        }
    }

    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = PhaseStatus::Running;
        self.timestamp = now;
        self.started_at = Some(now);
    }

    pub fn finish(&mut self, status: PhaseStatus, logs: impl Into<String>) {
        let now = Utc::now();
        self.status = status;
        self.timestamp = now;
        self.finished_at = Some(now);
        self.logs = logs.into();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub repo_id: i64,
    pub status: RunStatus,
    pub commit_sha: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseRecord>,
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl PipelineRun {
    pub fn queued(id: impl Into<String>, repo_id: i64, commit_sha: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            repo_id,
            status: RunStatus::Queued,
            commit_sha: commit_sha.into(),
            started_at: None,
            finished_at: None,
            phases: Vec::new(),
            metrics: Metrics::new(),
            failure_reason: None,
        }
    }

    pub fn phase(&self, name: PhaseName) -> Option<&PhaseRecord> {
        self.phases.iter().rev().find(|record| record.name == name)
    }

    /// Latest attempt recorded, or 0 before the first phase starts.
    pub fn attempt(&self) -> u32 {
        self.phases.iter().map(|p| p.attempt).max().unwrap_or(0)
    }
}

/// Payload carried on the live topic and the durable per-pipeline log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub pipeline_id: String,
    pub phase: String,
    pub status: String,
    #[serde(default)]
    pub logs: String,
    pub timestamp: DateTime<Utc>,
}

pub const COMPLETE_PHASE: &str = "complete";
pub const SHUTDOWN_PHASE: &str = "shutdown";
pub const RETRY_PHASE: &str = "retry";

impl PhaseEvent {
    pub fn new(
        pipeline_id: &str,
        phase: impl Into<String>,
        status: impl Into<String>,
        logs: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            phase: phase.into(),
            status: status.into(),
            logs: logs.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_record(pipeline_id: &str, record: &PhaseRecord) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            phase: record.name.as_str().to_string(),
            status: record.status.as_str().to_string(),
            logs: record.logs.clone(),
            timestamp: record.timestamp,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == COMPLETE_PHASE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDeploymentRecord {
    pub id: Option<i64>,
    pub model_name: String,
    pub version: String,
    pub accuracy: f64,
    pub endpoint_url: String,
    pub deployed_at: DateTime<Utc>,
    pub is_active: bool,
    pub pipeline_id: Option<String>,
}

/// The reference a run needs to locate its notebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub id: i64,
    pub github_url: String,
    pub branch: String,
    pub notebook_path: String,
    #[serde(default)]
    pub is_active: bool,
}
