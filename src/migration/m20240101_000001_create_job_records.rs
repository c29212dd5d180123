//! Migration: Create the job record table.
//!
//! One row per job name. Batch/status queries drive pending and rollback selection.

use sea_orm_migration::prelude::*;

use crate::config::defaults;
use crate::entity::job_record::JobRecordColumn;

pub struct Migration {
    table: String,
}

impl Migration {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl Default for Migration {
    fn default() -> Self {
        Self::new(defaults::TABLE)
    }
}

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20240101_000001_create_job_records"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        create_table(manager, &self.table).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(Alias::new(&self.table))
                    .if_exists()
                    .to_owned(),
            )
            .await
    }
}

/// Create the record table and its indexes if they do not exist yet.
pub async fn create_table(manager: &SchemaManager<'_>, table: &str) -> Result<(), DbErr> {
    manager.create_table(table_statement(table)).await?;

    // Batch/status lookups for rollback selection
    manager
        .create_index(
            Index::create()
                .if_not_exists()
                .name(format!("idx_{}_batch_status", table))
                .table(Alias::new(table))
                .col(JobRecordColumn::Batch)
                .col(JobRecordColumn::Status)
                .to_owned(),
        )
        .await?;

    Ok(())
}

fn table_statement(table: &str) -> TableCreateStatement {
    Table::create()
        .table(Alias::new(table))
        .if_not_exists()
        .col(
            ColumnDef::new(JobRecordColumn::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new(JobRecordColumn::Name)
                .string_len(255)
                .not_null()
                .unique_key(),
        )
        .col(ColumnDef::new(JobRecordColumn::Batch).big_integer().not_null())
        .col(
            ColumnDef::new(JobRecordColumn::Status)
                .string_len(20)
                .not_null()
                .default("running"),
        )
        .col(ColumnDef::new(JobRecordColumn::RowsAffected).big_integer())
        .col(ColumnDef::new(JobRecordColumn::DurationMs).big_integer())
        .col(ColumnDef::new(JobRecordColumn::ErrorMessage).text())
        .col(ColumnDef::new(JobRecordColumn::Metadata).text())
        .col(ColumnDef::new(JobRecordColumn::StartedAt).timestamp_with_time_zone())
        .col(ColumnDef::new(JobRecordColumn::CompletedAt).timestamp_with_time_zone())
        .col(
            ColumnDef::new(JobRecordColumn::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(JobRecordColumn::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned()
}
