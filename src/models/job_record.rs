//! Job record domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::entity::job_record::Model;
use crate::error::AppError;

/// Execution status of a job.
///
/// `Pending` is never persisted: it is the absence of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl JobStatus {
    /// Statuses that count as "ran" when computing pending jobs.
    pub const RAN: [JobStatus; 2] = [JobStatus::Completed, JobStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Whether a record with this status keeps the job out of the pending set.
    pub fn counts_as_ran(&self) -> bool {
        Self::RAN.contains(self)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One persisted job run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub name: String,
    pub batch: i64,
    pub status: JobStatus,
    pub rows_affected: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub metadata: Option<Map<String, JsonValue>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Description stored in the metadata map on completion.
    pub fn description(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("description"))
            .and_then(JsonValue::as_str)
    }
}

impl TryFrom<Model> for JobRecord {
    type Error = AppError;

    fn try_from(m: Model) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&m.status).ok_or_else(|| {
            AppError::InvalidInput(format!("Unknown job status '{}' for {}", m.status, m.name))
        })?;

        let metadata = match m.metadata.as_deref() {
            Some(raw) if !raw.is_empty() => Some(serde_json::from_str(raw)?),
            _ => None,
        };

        Ok(JobRecord {
            id: m.id,
            name: m.name,
            batch: m.batch,
            status,
            rows_affected: m.rows_affected,
            duration_ms: m.duration_ms,
            error_message: m.error_message,
            metadata,
            started_at: m.started_at,
            completed_at: m.completed_at,
            created_at: m.created_at,
            updated_at: m.updated_at,
        })
    }
}

/// A row of the status report: one per definition file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub name: String,
    pub batch: Option<i64>,
    pub status: JobStatus,
    pub rows_affected: Option<i64>,
    pub duration_ms: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusEntry {
    pub fn pending(name: String) -> Self {
        Self {
            name,
            batch: None,
            status: JobStatus::Pending,
            rows_affected: None,
            duration_ms: None,
            completed_at: None,
        }
    }

    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            name: record.name.clone(),
            batch: Some(record.batch),
            status: record.status,
            rows_affected: record.rows_affected,
            duration_ms: record.duration_ms,
            completed_at: record.completed_at,
        }
    }
}
