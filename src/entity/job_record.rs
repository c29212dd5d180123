//! Job record row for SeaORM.
//!
//! The table name is configurable, so rows are read with `FromQueryResult` and queries
//! are built with sea-query against `JobRecordColumn` instead of a static entity.

use sea_orm::entity::prelude::*;
use sea_orm::{DeriveIden, FromQueryResult};

#[derive(Clone, Debug, PartialEq, FromQueryResult)]
pub struct Model {
    pub id: i64,
    /// Stable job name derived from the definition filename
    pub name: String,
    pub batch: i64,
    /// running, completed, failed or rolled_back
    pub status: String,
    pub rows_affected: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    /// JSON-encoded key/value map
    pub metadata: Option<String>,
    pub started_at: Option<DateTimeUtc>,
    pub completed_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(DeriveIden, Clone, Copy, Debug)]
pub enum JobRecordColumn {
    Id,
    Name,
    Batch,
    Status,
    RowsAffected,
    DurationMs,
    ErrorMessage,
    Metadata,
    StartedAt,
    CompletedAt,
    CreatedAt,
    UpdatedAt,
}

impl JobRecordColumn {
    /// Every column, in `Model` field order.
    pub const ALL: [JobRecordColumn; 12] = [
        JobRecordColumn::Id,
        JobRecordColumn::Name,
        JobRecordColumn::Batch,
        JobRecordColumn::Status,
        JobRecordColumn::RowsAffected,
        JobRecordColumn::DurationMs,
        JobRecordColumn::ErrorMessage,
        JobRecordColumn::Metadata,
        JobRecordColumn::StartedAt,
        JobRecordColumn::CompletedAt,
        JobRecordColumn::CreatedAt,
        JobRecordColumn::UpdatedAt,
    ];
}
