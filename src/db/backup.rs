//! Pre-job table backups.
//!
//! SQLite databases are archived as a tar.gz of the database file (plus WAL/SHM) with a
//! manifest of the tables the job declared. PostgreSQL databases are dumped per table with
//! `pg_dump`. Anything else gets the null service, which reports itself unavailable.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{Builder, Header};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};

/// Backs up the tables a job is about to modify.
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Whether backups can be taken at all in this environment.
    async fn is_available(&self) -> bool;

    /// Back up `tables` ahead of `job_name`. Failures are reported as `false`, never raised.
    async fn backup_tables(&self, tables: &[String], job_name: &str) -> bool;
}

/// Backup service for databases that cannot be backed up.
pub struct NullBackupService;

#[async_trait]
impl BackupService for NullBackupService {
    async fn is_available(&self) -> bool {
        false
    }

    async fn backup_tables(&self, _tables: &[String], _job_name: &str) -> bool {
        false
    }
}

/// Archives a file-backed SQLite database.
pub struct ArchiveBackupService {
    db_file: PathBuf,
    backup_dir: PathBuf,
    keep: usize,
}

impl ArchiveBackupService {
    pub fn new(db_file: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            db_file: db_file.into(),
            backup_dir: backup_dir.into(),
            keep,
        }
    }

    /// Create the archive for one job. Returns its path.
    pub async fn create_backup(&self, tables: &[String], job_name: &str) -> AppResult<PathBuf> {
        if !self.db_file.exists() {
            return Err(AppError::NotFound(format!(
                "Database file {}",
                self.db_file.display()
            )));
        }

        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| AppError::FileSystem(format!("Failed to create backup directory: {}", e)))?;

        // Backup filename format: `{job}_{YYYYMMDD_HHMMSS}.tar.gz`
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = self
            .backup_dir
            .join(format!("{}_{}.tar.gz", job_name, timestamp));

        let db_file = self.db_file.clone();
        let manifest = manifest(tables, job_name);
        let target = backup_path.clone();

        tokio::task::spawn_blocking(move || create_tar_gz(&db_file, &manifest, &target))
            .await
            .map_err(|e| AppError::FileSystem(format!("Backup task failed: {}", e)))??;

        info!("Created backup: {}", backup_path.display());

        if self.keep > 0 {
            cleanup_old_backups(&self.backup_dir, self.keep).await?;
        }

        Ok(backup_path)
    }
}

#[async_trait]
impl BackupService for ArchiveBackupService {
    async fn is_available(&self) -> bool {
        self.db_file.exists()
    }

    async fn backup_tables(&self, tables: &[String], job_name: &str) -> bool {
        match self.create_backup(tables, job_name).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Backup before {} failed: {}", job_name, e);
                false
            }
        }
    }
}

/// Dumps the affected PostgreSQL tables with `pg_dump`.
///
/// The password never appears in `pg_dump`'s arguments; it is passed through `PGPASSWORD`.
pub struct PgDumpBackupService {
    dbname: String,
    password: Option<String>,
    backup_dir: PathBuf,
    available: OnceCell<bool>,
}

impl PgDumpBackupService {
    pub fn new(database_url: &str, backup_dir: impl Into<PathBuf>) -> Self {
        let (dbname, password) = split_password(database_url);

        Self {
            dbname,
            password,
            backup_dir: backup_dir.into(),
            available: OnceCell::new(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new("pg_dump");
        command.arg(format!("--dbname={}", self.dbname));
        if let Some(password) = &self.password {
            command.env("PGPASSWORD", password);
        }
        command
    }

    async fn dump(&self, tables: &[String], job_name: &str) -> AppResult<PathBuf> {
        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| AppError::FileSystem(format!("Failed to create backup directory: {}", e)))?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let dump_path = self
            .backup_dir
            .join(format!("{}_{}.sql", job_name, timestamp));

        let mut command = self.command();
        for table in tables {
            command.arg(format!("--table={}", table));
        }
        command.arg("--file").arg(&dump_path);

        let output = command
            .output()
            .await
            .map_err(|e| AppError::FileSystem(format!("Failed to spawn pg_dump: {}", e)))?;

        if !output.status.success() {
            return Err(AppError::FileSystem(format!(
                "pg_dump exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!("Created backup: {}", dump_path.display());
        Ok(dump_path)
    }
}

#[async_trait]
impl BackupService for PgDumpBackupService {
    /// Checked once, on first use.
    async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                let found = Command::new("pg_dump")
                    .arg("--version")
                    .output()
                    .await
                    .map(|out| out.status.success())
                    .unwrap_or(false);
                if !found {
                    warn!("pg_dump not found, PostgreSQL backups are unavailable");
                }
                found
            })
            .await
    }

    async fn backup_tables(&self, tables: &[String], job_name: &str) -> bool {
        if tables.is_empty() {
            warn!("Job {} declares no affected tables, nothing to back up", job_name);
            return false;
        }

        match self.dump(tables, job_name).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Backup before {} failed: {}", job_name, e);
                false
            }
        }
    }
}

/// Pick the backup service matching the default database URL.
pub fn from_config(config: &Config) -> Arc<dyn BackupService> {
    let url = &config.database.url;
    let safety = &config.jobs.safety;

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return Arc::new(PgDumpBackupService::new(url, &safety.backup_dir));
    }

    match sqlite_file(url) {
        Some(path) => Arc::new(ArchiveBackupService::new(
            path,
            &safety.backup_dir,
            safety.backup_keep,
        )),
        None => Arc::new(NullBackupService),
    }
}

/// Database file behind a SQLite URL, `None` for in-memory or non-SQLite URLs.
pub fn sqlite_file(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);

    if path.is_empty() || path.contains(":memory:") {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// Remove the password from a connection URL. Returns the URL and the decoded password.
fn split_password(url: &str) -> (String, Option<String>) {
    let Some((scheme, rest)) = url.split_once("://") else {
        return (url.to_string(), None);
    };
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    let Some((userinfo, host)) = authority.rsplit_once('@') else {
        return (url.to_string(), None);
    };
    let Some((user, password)) = userinfo.split_once(':') else {
        return (url.to_string(), None);
    };

    let password = urlencoding::decode(password)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| password.to_string());

    (format!("{}://{}@{}{}", scheme, user, host, tail), Some(password))
}

fn manifest(tables: &[String], job_name: &str) -> String {
    let mut manifest = format!("job: {}\ncreated_at: {}\n", job_name, Utc::now().to_rfc3339());
    for table in tables {
        manifest.push_str("table: ");
        manifest.push_str(table);
        manifest.push('\n');
    }
    manifest
}

fn sibling(db_file: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(db_file.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Create a tar.gz archive containing the database, its WAL files and the manifest.
fn create_tar_gz(db_file: &Path, manifest: &str, backup_path: &Path) -> AppResult<()> {
    let file = File::create(backup_path)
        .map_err(|e| AppError::FileSystem(format!("Failed to create backup file: {}", e)))?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut archive = Builder::new(encoder);

    let db_name = db_file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("database.db");
    archive
        .append_path_with_name(db_file, db_name)
        .map_err(|e| AppError::FileSystem(format!("Failed to add database to backup: {}", e)))?;

    for suffix in ["-wal", "-shm"] {
        let path = sibling(db_file, suffix);
        if path.exists() {
            archive
                .append_path_with_name(&path, format!("{}{}", db_name, suffix))
                .map_err(|e| {
                    AppError::FileSystem(format!("Failed to add {} file to backup: {}", suffix, e))
                })?;
        }
    }

    let mut header = Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    archive
        .append_data(&mut header, "tables.txt", manifest.as_bytes())
        .map_err(|e| AppError::FileSystem(format!("Failed to add manifest to backup: {}", e)))?;

    archive
        .into_inner()
        .map_err(|e| AppError::FileSystem(format!("Failed to finish tar: {}", e)))?
        .finish()
        .map_err(|e| AppError::FileSystem(format!("Failed to finish gzip: {}", e)))?;

    Ok(())
}

/// Removes old backup archives, keeping only the most recent N.
pub async fn cleanup_old_backups(backup_dir: &Path, keep_count: usize) -> AppResult<()> {
    let mut entries = Vec::new();

    let mut dir = match tokio::fs::read_dir(backup_dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(AppError::FileSystem(format!(
                "Failed to read backup directory: {}",
                e
            )));
        }
    };

    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| AppError::FileSystem(format!("Failed to read backup entry: {}", e)))?
    {
        let path = entry.path();
        let is_backup = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".tar.gz"));

        if !is_backup {
            continue;
        }
        if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
            entries.push((path, modified));
        }
    }

    // Newest first
    entries.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in entries.into_iter().skip(keep_count) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Removed old backup: {}", path.display()),
            Err(e) => warn!("Failed to remove old backup {}: {}", path.display(), e),
        }
    }

    Ok(())
}
