//! Domain error types for data jobs.
//!
//! Uses thiserror for ergonomic error handling with automatic Display implementations.
//! `AppError` is what the engine returns to callers; `JobError` is what a job's own
//! forward/reverse logic returns to the engine.

use sea_orm::DbErr;

/// Application-level errors.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Invalid input data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// File system operation failed
    #[error("File system error: {0}")]
    FileSystem(String),

    /// The job record table has not been provisioned
    #[error("Job record table '{0}' not found. Run the install command first")]
    MissingRepository(String),

    /// A job's forward or reverse logic failed
    #[error("Job {name} failed: {source}")]
    Execution {
        name: String,
        #[source]
        source: JobError,
    },

    /// A job failed and its failure could not be written to the record table
    #[error("Job {name} failed: {source} (recording the failure also failed: {record_error})")]
    UnrecordedFailure {
        name: String,
        #[source]
        source: JobError,
        record_error: String,
    },
}

impl AppError {
    /// Name of the job whose logic failed, if any.
    pub fn failed_job(&self) -> Option<&str> {
        match self {
            AppError::Execution { name, .. } | AppError::UnrecordedFailure { name, .. } => {
                Some(name)
            }
            _ => None,
        }
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

/// Errors raised from inside a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Database(#[from] DbErr),

    #[error("Job exceeded the timeout limit of {0} seconds")]
    Timeout(u64),

    #[error("Job is not reversible")]
    NotReversible,

    #[error("{0}")]
    Failed(String),
}

impl JobError {
    /// Build a failure from any message.
    pub fn fail(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }
}

// Conversion implementations for common error types

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<DbErr> for AppError {
    fn from(err: DbErr) -> Self {
        AppError::Database(err.to_string())
    }
}
