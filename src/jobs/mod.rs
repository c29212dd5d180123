//! Job units: the contract user-defined data jobs implement.

pub mod context;
pub mod progress;
pub mod registry;
pub mod sql;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::JobError;

pub use context::JobContext;
pub use progress::ProgressTracker;
pub use registry::JobRegistry;
pub use sql::SqlJob;

/// Time budget a job declares for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTimeout {
    /// Use the configured process-wide default
    #[default]
    Default,
    /// No limit, regardless of configuration
    Unlimited,
    /// Limit in seconds; 0 behaves like `Default`
    Seconds(u64),
}

impl JobTimeout {
    /// Effective limit in seconds given the configured default (0 = unlimited).
    pub fn resolve(&self, default_secs: u64) -> Option<u64> {
        let secs = match self {
            JobTimeout::Unlimited => return None,
            JobTimeout::Default | JobTimeout::Seconds(0) => default_secs,
            JobTimeout::Seconds(secs) => *secs,
        };
        (secs > 0).then_some(secs)
    }
}

/// Read-only preview of what a job would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    pub description: String,
    pub affected_tables: Vec<String>,
    pub estimated_rows: Option<u64>,
    pub reversible: bool,
    pub idempotent: bool,
    pub uses_transaction: bool,
}

/// A single data transformation.
///
/// `up` is required. `down` is only called when `reversible()` returns true; the
/// orchestrator never infers reversibility from anything else.
#[async_trait]
pub trait DataJob: Send {
    /// Forward logic.
    async fn up(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError>;

    /// Reverse logic.
    async fn down(&mut self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
        Err(JobError::NotReversible)
    }

    /// Whether `down` undoes `up`.
    fn reversible(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        String::new()
    }

    /// Tables this job modifies; drives pre-job backups.
    fn affected_tables(&self) -> Vec<String> {
        Vec::new()
    }

    /// Informational only: re-running `up` causes no harm.
    fn idempotent(&self) -> bool {
        false
    }

    /// Preferred transaction wrapping, subject to the configured mode.
    fn within_transaction(&self) -> bool {
        true
    }

    fn timeout(&self) -> JobTimeout {
        JobTimeout::Default
    }

    /// Named connection to run on; `None` is the default connection.
    fn connection(&self) -> Option<&str> {
        None
    }

    /// Row estimate used for the pre-run confirmation threshold.
    fn estimated_rows(&self) -> Option<u64> {
        None
    }

    fn dry_run(&self) -> DryRunReport {
        DryRunReport {
            description: self.description(),
            affected_tables: self.affected_tables(),
            estimated_rows: self.estimated_rows(),
            reversible: self.reversible(),
            idempotent: self.idempotent(),
            uses_transaction: self.within_transaction(),
        }
    }
}
