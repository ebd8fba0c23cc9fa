use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a queued job.
///
/// Moves pending → processing → {completed, failed}. The only way back is
/// orphan recovery, which returns a stuck processing job to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A unit of work in the persistent queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: Map<String, Value>,
    pub status: JobStatus,
    /// Last state the engine checkpointed, `None` until the first run.
    pub current_state: Option<String>,
    /// Variables accumulated by earlier runs; seeds the next run's context.
    pub variables: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Token of the run currently holding the job; set only while processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
}

/// Immutable audit entry for one executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub job_id: String,
    /// Gapless, strictly increasing per job, starting at 1.
    pub sequence: i64,
    pub state: String,
    pub action: String,
    pub outcome: String,
    pub recorded_at: DateTime<Utc>,
    pub metadata: Value,
}

/// A job together with its full step timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub final_state: Option<String>,
    pub error_message: Option<String>,
    pub steps: Vec<StepRecord>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time from creation to completion (or to now while still open).
    pub duration_ms: i64,
}

impl JobReport {
    pub fn from_job(job: &Job, steps: Vec<StepRecord>) -> Self {
        let end = job.completed_at.unwrap_or_else(Utc::now);
        let duration = end - job.created_at;

        Self {
            job_id: job.id.clone(),
            status: job.status,
            final_state: job.current_state.clone(),
            error_message: job.error_message.clone(),
            steps,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            duration_ms: duration.num_milliseconds(),
        }
    }
}
