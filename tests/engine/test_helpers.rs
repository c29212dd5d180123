//! Shared helpers for engine tests.
//!
//! Every test gets its own SQLite database file and job directory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use data_jobs::config::{DatabaseConfig, JobsConfig};
use data_jobs::db::backup::{BackupService, NullBackupService};
use data_jobs::db::{DbPool, JobRepository};
use data_jobs::error::JobError;
use data_jobs::jobs::{DataJob, JobContext, JobRegistry, JobTimeout};
use data_jobs::models::JobRecord;
use data_jobs::services::{JobResolver, Orchestrator};
use sea_orm::sea_query::{Alias, Condition, Expr};
use sea_orm::{ConnectionTrait, DatabaseConnection, Statement, Value};
use tempfile::{NamedTempFile, TempDir};

pub const TABLE: &str = "data_jobs";

/// A job file bound to a registered Rust job rather than inline SQL.
pub const REGISTERED: &str = "-- implemented by a registered job type\n";

pub struct TestEnv {
    _db_file: NamedTempFile,
    pub jobs_dir: TempDir,
    pub pool: DbPool,
    /// Makes `FlakyImport` fail while set
    pub fail: Arc<AtomicBool>,
}

impl TestEnv {
    /// Database with the record table and an `events` table.
    pub async fn new() -> Self {
        let env = Self::bare().await;
        env.repository()
            .create_repository()
            .await
            .expect("Failed to create job record table");
        env
    }

    /// Database with only the `events` table.
    pub async fn bare() -> Self {
        let (db_file, pool) = events_database().await;

        Self {
            _db_file: db_file,
            jobs_dir: TempDir::new().expect("Failed to create job directory"),
            pool,
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> JobsConfig {
        JobsConfig {
            path: self.jobs_dir.path().to_path_buf(),
            table: TABLE.to_string(),
            ..JobsConfig::default()
        }
    }

    pub fn repository(&self) -> JobRepository {
        JobRepository::new(self.pool.connection().clone(), TABLE)
    }

    pub fn resolver(&self) -> JobResolver {
        JobResolver::new(self.jobs_dir.path(), registry(Arc::clone(&self.fail)))
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(self.settings(), Arc::new(NullBackupService))
    }

    pub fn orchestrator_with(
        &self,
        settings: JobsConfig,
        backup: Arc<dyn BackupService>,
    ) -> Orchestrator {
        Orchestrator::new(self.pool.clone(), self.resolver(), backup, settings)
    }

    /// Orchestrator over a pool other than the environment's own.
    pub fn orchestrator_on(&self, pool: DbPool) -> Orchestrator {
        Orchestrator::new(pool, self.resolver(), Arc::new(NullBackupService), self.settings())
    }

    pub fn write_job(&self, name: &str, content: &str) {
        std::fs::write(self.jobs_dir.path().join(format!("{}.sql", name)), content)
            .expect("Failed to write job file");
    }

    pub fn remove_job(&self, name: &str) {
        std::fs::remove_file(self.jobs_dir.path().join(format!("{}.sql", name)))
            .expect("Failed to remove job file");
    }

    pub async fn record(&self, name: &str) -> JobRecord {
        self.repository()
            .get_by_name(name)
            .await
            .expect("Failed to read record")
            .unwrap_or_else(|| panic!("No record for {}", name))
    }

    /// Rows stored for `name`, whatever their status.
    pub async fn record_count(&self, name: &str) -> i64 {
        let db = self.pool.connection();
        db.query_one(Statement::from_sql_and_values(
            db.get_database_backend(),
            format!("SELECT COUNT(*) AS n FROM {} WHERE name = ?", TABLE),
            [Value::from(name)],
        ))
        .await
        .expect("Failed to count records")
        .and_then(|row| row.try_get::<i64>("", "n").ok())
        .unwrap_or(0)
    }

    pub async fn event_labels(&self) -> Vec<String> {
        labels(self.pool.connection()).await
    }

    pub async fn seed_events(&self, count: usize) {
        for i in 0..count {
            self.pool
                .connection()
                .execute_unprepared(&format!("INSERT INTO events (label) VALUES ('seed-{}')", i))
                .await
                .expect("Failed to seed events");
        }
    }

    pub fn fail_jobs(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

/// A single-connection pool over a fresh SQLite file holding an `events` table.
pub async fn events_database() -> (NamedTempFile, DbPool) {
    let db_file = NamedTempFile::new().expect("Failed to create temp db file");
    let url = format!("sqlite://{}?mode=rwc", db_file.path().display());

    let pool = DbPool::new(&DatabaseConfig {
        url,
        connections: BTreeMap::new(),
        max_connections: 1,
    })
    .await
    .expect("Failed to connect test database");

    pool.connection()
        .execute_unprepared(
            "CREATE TABLE events (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT NOT NULL)",
        )
        .await
        .expect("Failed to create events table");

    (db_file, pool)
}

/// Labels in `events`, in insertion order.
pub async fn labels(db: &DatabaseConnection) -> Vec<String> {
    db.query_all(Statement::from_string(
        db.get_database_backend(),
        "SELECT label FROM events ORDER BY id",
    ))
    .await
    .expect("Failed to read events")
    .iter()
    .map(|row| row.try_get::<String>("", "label").expect("label column"))
    .collect()
}

/// Inline job inserting one `events` row, optionally reversible.
pub fn insert_job(label: &str, reversible: bool) -> String {
    let mut sql = format!(
        "-- @description: insert {label}\n-- @tables: events\n\n-- +up\nINSERT INTO events (label) VALUES ('{label}');\n"
    );
    if reversible {
        sql.push_str(&format!(
            "\n-- +down\nDELETE FROM events WHERE label = '{label}';\n"
        ));
    }
    sql
}

fn registry(fail: Arc<AtomicBool>) -> JobRegistry {
    JobRegistry::new()
        .with("FlakyImport", move || {
            Box::new(FlakyImport {
                fail: Arc::clone(&fail),
            })
        })
        .with("SlowBackfill", || Box::new(SlowBackfill))
        .with("MarkEvents", || Box::new(MarkEvents))
        .with("CountEvents", || Box::new(CountEvents))
        .with("DropLedger", || Box::new(DropLedger))
}

/// Writes a row, then fails with "boom" while the shared flag is set.
struct FlakyImport {
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl DataJob for FlakyImport {
    async fn up(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        ctx.db()
            .execute_unprepared("INSERT INTO events (label) VALUES ('partial')")
            .await?;
        ctx.affected(1);

        if self.fail.load(Ordering::SeqCst) {
            return Err(JobError::fail("boom"));
        }
        Ok(())
    }

    fn description(&self) -> String {
        "Import that fails on demand".to_string()
    }
}

/// Sleeps well past its own one-second limit.
struct SlowBackfill;

#[async_trait]
impl DataJob for SlowBackfill {
    async fn up(&mut self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }

    fn timeout(&self) -> JobTimeout {
        JobTimeout::Seconds(1)
    }
}

/// Relabels every event in chunks of two.
struct MarkEvents;

#[async_trait]
impl DataJob for MarkEvents {
    async fn up(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let total = ctx
            .chunk_update(
                "events",
                &[("label", Value::from("done"))],
                Condition::all().add(Expr::col(Alias::new("label")).ne("done")),
                Some(2),
            )
            .await?;
        ctx.affected(total);
        ctx.log(format!("Marked {} events", total));
        Ok(())
    }

    fn affected_tables(&self) -> Vec<String> {
        vec!["events".to_string()]
    }
}

/// Counts events through the keyset stream.
struct CountEvents;

#[async_trait]
impl DataJob for CountEvents {
    async fn up(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let mut seen = 0u64;
        ctx.chunk_lazy("events", Some(2), |_row| {
            seen += 1;
            async { Ok::<(), JobError>(()) }
        })
        .await?;
        ctx.affected(seen);
        Ok(())
    }

    fn estimated_rows(&self) -> Option<u64> {
        Some(500)
    }
}

/// Drops the job record table, then fails, so its failure cannot be recorded.
struct DropLedger;

#[async_trait]
impl DataJob for DropLedger {
    async fn up(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        ctx.db()
            .execute_unprepared(&format!("DROP TABLE {}", TABLE))
            .await?;
        Err(JobError::fail("ledger gone"))
    }

    fn within_transaction(&self) -> bool {
        false
    }
}

/// Backup fake that records each request.
pub struct RecordingBackup {
    available: bool,
    succeed: bool,
    calls: Mutex<Vec<(Vec<String>, String)>>,
}

impl RecordingBackup {
    pub fn new(available: bool, succeed: bool) -> Self {
        Self {
            available,
            succeed,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(Vec<String>, String)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl BackupService for RecordingBackup {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn backup_tables(&self, tables: &[String], job_name: &str) -> bool {
        self.calls
            .lock()
            .expect("calls lock")
            .push((tables.to_vec(), job_name.to_string()));
        self.succeed
    }
}
