//! Domain models for data jobs.

pub mod job_record;

// Re-export commonly used types
pub use job_record::{JobRecord, JobStatus, StatusEntry};
