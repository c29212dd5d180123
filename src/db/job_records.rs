//! Job record repository: durable bookkeeping of which jobs ran and how.
//!
//! All mutations are single-statement and keyed by job name; the table carries a unique
//! constraint on `name`, so a re-run replaces a failed or rolled back record instead of
//! adding a second one.

use std::collections::HashSet;

use chrono::Utc;
use sea_orm::sea_query::{
    Alias, DeleteStatement, Expr, Func, Order, Query, SelectStatement, SimpleExpr,
};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, FromQueryResult, StatementBuilder, TransactionTrait,
};
use sea_orm_migration::SchemaManager;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::entity::job_record::{JobRecordColumn, Model};
use crate::error::{AppError, AppResult};
use crate::migration::create_job_records_table;
use crate::models::{JobRecord, JobStatus};

#[derive(Clone)]
pub struct JobRepository {
    db: DatabaseConnection,
    table: String,
}

impl JobRepository {
    pub fn new(db: DatabaseConnection, table: impl Into<String>) -> Self {
        Self {
            db,
            table: table.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Names of jobs whose record counts as ran (completed or running).
    pub async fn list_ran(&self) -> AppResult<HashSet<String>> {
        let stmt = self.select().and_where(ran_condition()).to_owned();

        let records = self.fetch(&stmt).await?;
        Ok(records.into_iter().map(|r| r.name).collect())
    }

    /// All records, newest batch first and descending by name within a batch.
    pub async fn list_records(&self, limit: Option<u64>) -> AppResult<Vec<JobRecord>> {
        let mut stmt = self
            .select()
            .order_by(JobRecordColumn::Batch, Order::Desc)
            .order_by(JobRecordColumn::Name, Order::Desc)
            .to_owned();

        if let Some(limit) = limit {
            stmt.limit(limit);
        }

        self.fetch(&stmt).await
    }

    /// Completed/running records of the highest batch that still has any.
    pub async fn last_batch_records(&self) -> AppResult<Vec<JobRecord>> {
        let last_batch = self.max_batch(true).await?;

        let Some(batch) = last_batch else {
            return Ok(Vec::new());
        };

        let stmt = self
            .select()
            .and_where(Expr::col(JobRecordColumn::Batch).eq(batch))
            .and_where(ran_condition())
            .order_by(JobRecordColumn::Name, Order::Desc)
            .to_owned();

        self.fetch(&stmt).await
    }

    /// Every record of a batch regardless of status, descending by name.
    pub async fn records_for_batch(&self, batch: i64) -> AppResult<Vec<JobRecord>> {
        let stmt = self
            .select()
            .and_where(Expr::col(JobRecordColumn::Batch).eq(batch))
            .order_by(JobRecordColumn::Name, Order::Desc)
            .to_owned();

        self.fetch(&stmt).await
    }

    /// Record that a job is starting.
    ///
    /// A previous failed or rolled back record for the same name is replaced.
    pub async fn log_start(&self, name: &str, batch: i64) -> AppResult<()> {
        let replace = Query::delete()
            .from_table(self.table())
            .and_where(Expr::col(JobRecordColumn::Name).eq(name))
            .and_where(Expr::col(JobRecordColumn::Status).is_in([
                JobStatus::Failed.as_str(),
                JobStatus::RolledBack.as_str(),
            ]))
            .to_owned();
        let replaced = execute(&self.db, &replace).await?;
        if replaced > 0 {
            debug!("Replaced previous record for {}", name);
        }

        let now = Utc::now();
        let insert = Query::insert()
            .into_table(self.table())
            .columns([
                JobRecordColumn::Name,
                JobRecordColumn::Batch,
                JobRecordColumn::Status,
                JobRecordColumn::StartedAt,
                JobRecordColumn::CreatedAt,
                JobRecordColumn::UpdatedAt,
            ])
            .values_panic([
                name.into(),
                batch.into(),
                JobStatus::Running.as_str().into(),
                now.into(),
                now.into(),
                now.into(),
            ])
            .to_owned();

        execute(&self.db, &insert)
            .await
            .map_err(|e| AppError::Database(format!("Failed to log start of {}: {}", name, e)))?;

        Ok(())
    }

    /// Record a successful run.
    pub async fn log_complete(
        &self,
        name: &str,
        rows_affected: u64,
        duration_ms: u64,
        metadata: &Map<String, JsonValue>,
    ) -> AppResult<()> {
        let now = Utc::now();
        let metadata = serde_json::to_string(metadata)?;

        let update = Query::update()
            .table(self.table())
            .values([
                (JobRecordColumn::Status, JobStatus::Completed.as_str().into()),
                (JobRecordColumn::RowsAffected, to_i64(rows_affected).into()),
                (JobRecordColumn::DurationMs, to_i64(duration_ms).into()),
                (JobRecordColumn::Metadata, metadata.into()),
                (JobRecordColumn::CompletedAt, now.into()),
                (JobRecordColumn::UpdatedAt, now.into()),
                (JobRecordColumn::ErrorMessage, Option::<String>::None.into()),
            ])
            .and_where(Expr::col(JobRecordColumn::Name).eq(name))
            .to_owned();

        self.update_one(name, &update).await
    }

    /// Record a failed run.
    pub async fn log_failed(&self, name: &str, error_message: &str) -> AppResult<()> {
        let update = Query::update()
            .table(self.table())
            .values([
                (JobRecordColumn::Status, JobStatus::Failed.as_str().into()),
                (JobRecordColumn::ErrorMessage, error_message.into()),
                (JobRecordColumn::UpdatedAt, Utc::now().into()),
            ])
            .and_where(Expr::col(JobRecordColumn::Name).eq(name))
            .to_owned();

        self.update_one(name, &update).await
    }

    /// Record that a job's reverse logic ran.
    pub async fn log_rollback(&self, name: &str) -> AppResult<()> {
        let update = Query::update()
            .table(self.table())
            .values([
                (JobRecordColumn::Status, JobStatus::RolledBack.as_str().into()),
                (JobRecordColumn::UpdatedAt, Utc::now().into()),
            ])
            .and_where(Expr::col(JobRecordColumn::Name).eq(name))
            .to_owned();

        self.update_one(name, &update).await
    }

    /// Delete a job record.
    pub async fn delete(&self, name: &str) -> AppResult<()> {
        execute(&self.db, &self.delete_statement(name)).await?;
        Ok(())
    }

    /// Delete every record in one transaction. Returns the deleted names.
    pub async fn reset(&self) -> AppResult<Vec<String>> {
        let records = self.list_records(None).await?;

        let txn = self.db.begin().await?;
        for record in &records {
            execute(&txn, &self.delete_statement(&record.name)).await?;
        }
        txn.commit().await?;

        Ok(records.into_iter().map(|r| r.name).collect())
    }

    pub async fn next_batch_number(&self) -> AppResult<i64> {
        Ok(self.last_batch_number().await? + 1)
    }

    /// Highest batch across all records, 0 when the table is empty.
    pub async fn last_batch_number(&self) -> AppResult<i64> {
        Ok(self.max_batch(false).await?.unwrap_or(0))
    }

    pub async fn get_by_name(&self, name: &str) -> AppResult<Option<JobRecord>> {
        let stmt = self
            .select()
            .and_where(Expr::col(JobRecordColumn::Name).eq(name))
            .limit(1)
            .to_owned();

        Ok(self.fetch(&stmt).await?.into_iter().next())
    }

    pub async fn has_run(&self, name: &str) -> AppResult<bool> {
        Ok(self
            .get_by_name(name)
            .await?
            .is_some_and(|r| r.status.counts_as_ran()))
    }

    /// Whether the record table itself has been provisioned.
    pub async fn repository_exists(&self) -> AppResult<bool> {
        let manager = SchemaManager::new(&self.db);
        Ok(manager.has_table(&self.table).await?)
    }

    /// Provision the record table (no-op if it already exists).
    pub async fn create_repository(&self) -> AppResult<()> {
        let manager = SchemaManager::new(&self.db);
        create_job_records_table(&manager, &self.table)
            .await
            .map_err(|e| AppError::Database(format!("Failed to create {}: {}", self.table, e)))
    }

    fn table(&self) -> Alias {
        Alias::new(&self.table)
    }

    fn select(&self) -> SelectStatement {
        Query::select()
            .columns(JobRecordColumn::ALL)
            .from(self.table())
            .to_owned()
    }

    fn delete_statement(&self, name: &str) -> DeleteStatement {
        Query::delete()
            .from_table(self.table())
            .and_where(Expr::col(JobRecordColumn::Name).eq(name))
            .to_owned()
    }

    async fn max_batch(&self, ran_only: bool) -> AppResult<Option<i64>> {
        let mut stmt = Query::select()
            .expr_as(
                Func::max(Expr::col(JobRecordColumn::Batch)),
                Alias::new("max_batch"),
            )
            .from(self.table())
            .to_owned();

        if ran_only {
            stmt.and_where(ran_condition());
        }

        let backend = self.db.get_database_backend();
        let row = self.db.query_one(backend.build(&stmt)).await?;

        match row {
            Some(row) => Ok(row.try_get::<Option<i64>>("", "max_batch")?),
            None => Ok(None),
        }
    }

    async fn fetch(&self, stmt: &SelectStatement) -> AppResult<Vec<JobRecord>> {
        let backend = self.db.get_database_backend();
        let rows = Model::find_by_statement(backend.build(stmt))
            .all(&self.db)
            .await
            .map_err(|e| AppError::Database(format!("Failed to read {}: {}", self.table, e)))?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn update_one<S: StatementBuilder>(&self, name: &str, stmt: &S) -> AppResult<()> {
        let updated = execute(&self.db, stmt).await?;
        if updated == 0 {
            warn!("No job record named {} to update", name);
        }
        Ok(())
    }
}

fn ran_condition() -> SimpleExpr {
    Expr::col(JobRecordColumn::Status).is_in(JobStatus::RAN.map(|s| s.as_str()))
}

async fn execute<C, S>(db: &C, stmt: &S) -> AppResult<u64>
where
    C: ConnectionTrait,
    S: StatementBuilder,
{
    let backend = db.get_database_backend();
    let result = db.execute(backend.build(stmt)).await?;
    Ok(result.rows_affected())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
