//! Orchestrator: runs pending jobs in batches, rolls batches back and reports status.
//!
//! Jobs run strictly one at a time in file-name order. A failing job is recorded as
//! `failed` and aborts the rest of the batch.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sea_orm::TransactionTrait;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info, warn};

use super::notifier::Notifier;
use super::resolver::JobResolver;
use crate::config::JobsConfig;
use crate::db::backup::BackupService;
use crate::db::{DbPool, JobConnection, JobRepository};
use crate::error::{AppError, AppResult, JobError};
use crate::jobs::{DataJob, DryRunReport, JobContext};
use crate::models::{JobRecord, StatusEntry};

const FAILURE_LOG_ATTEMPTS: u32 = 5;
const FAILURE_LOG_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Preview pending jobs without executing them or writing records
    pub dry_run: bool,
    /// Give every job its own batch number
    pub step: bool,
}

/// Rollback selection. `batch` wins over `step`; neither means the last batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackOptions {
    pub batch: Option<i64>,
    pub step: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

pub struct Orchestrator {
    pool: DbPool,
    repository: JobRepository,
    resolver: JobResolver,
    backup: Arc<dyn BackupService>,
    settings: JobsConfig,
    notifier: Option<Arc<dyn Notifier>>,
    notes: Vec<String>,
}

impl Orchestrator {
    pub fn new(
        pool: DbPool,
        resolver: JobResolver,
        backup: Arc<dyn BackupService>,
        settings: JobsConfig,
    ) -> Self {
        let repository = JobRepository::new(pool.connection().clone(), settings.table.clone());

        Self {
            pool,
            repository,
            resolver,
            backup,
            settings,
            notifier: None,
            notes: Vec::new(),
        }
    }

    /// Forward notes to `notifier` as they are produced.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn repository(&self) -> &JobRepository {
        &self.repository
    }

    pub fn resolver(&self) -> &JobResolver {
        &self.resolver
    }

    /// Notes produced by the last `run`, `rollback` or `fresh` call.
    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// Definition files without a completed or running record, in execution order.
    pub async fn pending_jobs(&self) -> AppResult<Vec<PathBuf>> {
        let ran = self.repository.list_ran().await?;

        Ok(self
            .resolver
            .list_job_files()?
            .into_iter()
            .filter(|path| !ran.contains(&JobResolver::derive_name(path)))
            .collect())
    }

    /// Run every pending job. Returns the files run (or previewed in dry-run mode).
    pub async fn run(&mut self, options: RunOptions) -> AppResult<Vec<PathBuf>> {
        self.notes.clear();
        self.ensure_repository().await?;
        self.run_pending(options).await
    }

    /// Delete every record, then run all jobs from scratch.
    ///
    /// Deleting records is a write, so dry-run mode is rejected before anything happens.
    pub async fn fresh(&mut self, options: RunOptions) -> AppResult<Vec<PathBuf>> {
        self.notes.clear();
        if options.dry_run {
            return Err(AppError::InvalidInput(
                "fresh deletes every job record and cannot run in dry-run mode".to_string(),
            ));
        }
        self.ensure_repository().await?;

        let deleted = self.repository.reset().await?;
        info!("Deleted {} job records", deleted.len());
        self.note(format!("Dropped {} job records.", deleted.len()));

        self.run_pending(options).await
    }

    /// Roll back the selected records. Returns the files whose reverse logic ran.
    pub async fn rollback(&mut self, options: RollbackOptions) -> AppResult<Vec<PathBuf>> {
        self.notes.clear();
        self.ensure_repository().await?;

        let records = match (options.batch, options.step) {
            (Some(batch), _) => self.repository.records_for_batch(batch).await?,
            (None, Some(step)) if step > 0 => self.repository.list_records(Some(step)).await?,
            _ => self.repository.last_batch_records().await?,
        };

        if records.is_empty() {
            self.note("Nothing to rollback.");
            return Ok(Vec::new());
        }

        let mut rolled_back = Vec::new();
        for record in records {
            let Some(file) = self.resolver.find_job_file(&record.name)? else {
                warn!("Job file not found for {}, skipping rollback", record.name);
                self.note(format!("Job file not found: {}", record.name));
                continue;
            };

            if self.rollback_job(&record, &file).await? {
                rolled_back.push(file);
            }
        }

        Ok(rolled_back)
    }

    /// One entry per definition file, `pending` where no record exists.
    pub async fn status(&self) -> AppResult<Vec<StatusEntry>> {
        self.ensure_repository().await?;

        let records: HashMap<String, JobRecord> = self
            .repository
            .list_records(None)
            .await?
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();

        Ok(self
            .resolver
            .list_job_files()?
            .iter()
            .map(|path| {
                let name = JobResolver::derive_name(path);
                match records.get(&name) {
                    Some(record) => StatusEntry::from_record(record),
                    None => StatusEntry::pending(name),
                }
            })
            .collect())
    }

    /// Sum of the row estimates of pending jobs; jobs without an estimate count as 0.
    pub async fn estimated_pending_rows(&self) -> AppResult<u64> {
        self.ensure_repository().await?;

        let mut total: u64 = 0;
        for file in self.pending_jobs().await? {
            let job = self.resolver.instantiate(&file)?;
            total = total.saturating_add(job.estimated_rows().unwrap_or(0));
        }
        Ok(total)
    }

    async fn ensure_repository(&self) -> AppResult<()> {
        if self.repository.repository_exists().await? {
            Ok(())
        } else {
            Err(AppError::MissingRepository(
                self.repository.table_name().to_string(),
            ))
        }
    }

    async fn run_pending(&mut self, options: RunOptions) -> AppResult<Vec<PathBuf>> {
        let pending = self.pending_jobs().await?;

        if pending.is_empty() {
            self.note("Nothing to migrate.");
            return Ok(Vec::new());
        }

        let mut batch = self.repository.next_batch_number().await?;
        info!(
            "Running {} pending data jobs in batch {} (dry run: {})",
            pending.len(),
            batch,
            options.dry_run
        );
        self.note("Running data jobs...");

        let mut ran = Vec::with_capacity(pending.len());
        for (index, file) in pending.into_iter().enumerate() {
            if options.step && index > 0 {
                batch += 1;
            }
            self.run_job(&file, batch, options.dry_run).await?;
            ran.push(file);
        }

        Ok(ran)
    }

    async fn run_job(&mut self, file: &Path, batch: i64, dry_run: bool) -> AppResult<()> {
        let name = JobResolver::derive_name(file);
        let mut job = self.resolver.instantiate(file)?;

        if dry_run {
            self.preview(&name, &job.dry_run());
            return Ok(());
        }

        self.note(format!("Migrating: {}", name));
        self.repository.log_start(&name, batch).await?;
        let started = Instant::now();

        self.auto_backup(job.as_ref(), &name).await;

        match self.execute(&name, job.as_mut(), Direction::Up).await {
            Ok(rows) => {
                let duration_ms = elapsed_ms(started);
                let mut metadata = Map::new();
                metadata.insert(
                    "description".to_string(),
                    JsonValue::String(job.description()),
                );

                self.repository
                    .log_complete(&name, rows, duration_ms, &metadata)
                    .await?;
                info!("Completed {} in {}ms ({} rows)", name, duration_ms, rows);
                self.note(format!("Migrated: {} ({}ms, {} rows)", name, duration_ms, rows));
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                error!("Job {} failed: {}", name, message);
                self.note(format!("Failed: {} - {}", name, message));

                match self.record_failure(&name, &message).await {
                    Ok(()) => Err(AppError::Execution { name, source: err }),
                    Err(log_err) => {
                        error!("Failed to record failure of {}: {}", name, log_err);
                        Err(AppError::UnrecordedFailure {
                            name,
                            source: err,
                            record_error: log_err.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Returns whether reverse logic ran.
    async fn rollback_job(&mut self, record: &JobRecord, file: &Path) -> AppResult<bool> {
        let name = record.name.as_str();
        let mut job = self.resolver.instantiate(file)?;

        if !job.reversible() {
            warn!("{} is not reversible, skipping", name);
            self.note(format!("Skipping (not reversible): {}", name));
            return Ok(false);
        }

        self.note(format!("Rolling back: {}", name));
        let started = Instant::now();

        match self.execute(name, job.as_mut(), Direction::Down).await {
            Ok(_) => {
                self.repository.log_rollback(name).await?;
                let duration_ms = elapsed_ms(started);
                info!("Rolled back {} in {}ms", name, duration_ms);
                self.note(format!("Rolled back: {} ({}ms)", name, duration_ms));
                Ok(true)
            }
            Err(err) => {
                error!("Rollback of {} failed: {}", name, err);
                self.note(format!("Rollback failed: {} - {}", name, err));
                Err(AppError::Execution {
                    name: name.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Run one direction of a job. Returns rows affected.
    ///
    /// The time limit covers the job's own logic only. Opening, committing and rolling back
    /// the transaction happen outside it, so a commit is never cut off halfway.
    async fn execute(
        &self,
        name: &str,
        job: &mut dyn DataJob,
        direction: Direction,
    ) -> Result<u64, JobError> {
        let limit = job.timeout().resolve(self.settings.timeout_secs);
        let conn = self
            .pool
            .named(job.connection())
            .map_err(|e| JobError::fail(e.to_string()))?;
        let chunk_size = self.settings.chunk_size;
        let logging = &self.settings.logging;

        if !self.settings.transaction.should_wrap(job.within_transaction()) {
            let ctx = JobContext::new(JobConnection::Pool(conn), name, chunk_size, logging);
            within_limit(limit, invoke(job, &ctx, direction)).await?;
            return Ok(ctx.rows_affected());
        }

        let txn = conn.begin().await?;
        let outcome = {
            let ctx = JobContext::new(JobConnection::Transaction(&txn), name, chunk_size, logging);
            within_limit(limit, invoke(job, &ctx, direction))
                .await
                .map(|()| ctx.rows_affected())
        };

        match outcome {
            Ok(rows) => {
                txn.commit().await?;
                Ok(rows)
            }
            Err(err) => {
                // Completes only after a statement cut off by the deadline has finished,
                // so the connection and its locks are free before the failure is recorded
                if let Err(rollback_err) = txn.rollback().await {
                    warn!("Failed to roll back transaction for {}: {}", name, rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Mark a job failed, retrying while the datastore is still busy with the job's work.
    async fn record_failure(&self, name: &str, message: &str) -> AppResult<()> {
        let mut attempt = 1;
        loop {
            match self.repository.log_failed(name, message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < FAILURE_LOG_ATTEMPTS => {
                    warn!(
                        "Recording failure of {} failed (attempt {}/{}): {}",
                        name, attempt, FAILURE_LOG_ATTEMPTS, e
                    );
                    tokio::time::sleep(FAILURE_LOG_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn auto_backup(&mut self, job: &dyn DataJob, name: &str) {
        if !self.settings.safety.auto_backup {
            return;
        }

        let backup = Arc::clone(&self.backup);
        if !backup.is_available().await {
            self.note("Auto backup enabled but backup service not available.");
            return;
        }

        let tables = job.affected_tables();
        if tables.is_empty() {
            return;
        }

        self.note("Creating backup before job...");
        if backup.backup_tables(&tables, name).await {
            self.note("Backup created successfully.");
        } else {
            self.note("Backup failed, continuing with job...");
        }
    }

    fn preview(&mut self, name: &str, report: &DryRunReport) {
        let or_na = |value: &str| {
            if value.is_empty() {
                "N/A".to_string()
            } else {
                value.to_string()
            }
        };

        self.note(format!("[DRY RUN] {}", name));
        self.note(format!("  Description: {}", or_na(&report.description)));
        self.note(format!(
            "  Affected tables: {}",
            or_na(&report.affected_tables.join(", "))
        ));
        self.note(format!(
            "  Estimated rows: {}",
            report
                .estimated_rows
                .map_or_else(|| "Unknown".to_string(), |rows| rows.to_string())
        ));
        self.note(format!("  Reversible: {}", yes_no(report.reversible)));
        self.note(format!("  Idempotent: {}", yes_no(report.idempotent)));
        self.note(format!("  Uses transaction: {}", yes_no(report.uses_transaction)));
        self.note("");
    }

    fn note(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!("{}", line);
        if let Some(notifier) = &self.notifier {
            notifier.note(&line);
        }
        self.notes.push(line);
    }
}

async fn within_limit<F>(limit: Option<u64>, work: F) -> Result<(), JobError>
where
    F: Future<Output = Result<(), JobError>>,
{
    match limit {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), work)
            .await
            .map_err(|_| JobError::Timeout(secs))?,
        None => work.await,
    }
}

async fn invoke(
    job: &mut dyn DataJob,
    ctx: &JobContext<'_>,
    direction: Direction,
) -> Result<(), JobError> {
    match direction {
        Direction::Up => job.up(ctx).await,
        Direction::Down => job.down(ctx).await,
    }
}

/// Elapsed wall time in milliseconds, rounded up so a finished job never reports 0.
fn elapsed_ms(started: Instant) -> u64 {
    let millis = started.elapsed().as_micros().div_ceil(1000).max(1);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

fn yes_no(value: bool) -> &'static str {
    if value { "Yes" } else { "No" }
}
