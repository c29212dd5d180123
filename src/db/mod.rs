//! Database module providing connection management, the job record repository and backups.

pub mod backup;
pub mod connection;
pub mod job_records;

use std::collections::HashMap;
use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};
use crate::migration::Migrator;

pub use connection::JobConnection;
pub use job_records::JobRepository;

/// Default connection plus any named connections jobs may target.
#[derive(Clone)]
pub struct DbPool {
    default: DatabaseConnection,
    named: HashMap<String, DatabaseConnection>,
}

impl DbPool {
    /// Connect the default database and every named connection from configuration.
    pub async fn new(config: &DatabaseConfig) -> AppResult<Self> {
        let default = connect(&config.url, config.max_connections).await?;
        info!("Database connection established");

        let mut pool = Self::from_connection(default);
        for (name, url) in &config.connections {
            let conn = connect(url, config.max_connections).await?;
            info!("Named connection '{}' established", name);
            pool.named.insert(name.clone(), conn);
        }

        Ok(pool)
    }

    /// Wrap an existing connection as the default.
    pub fn from_connection(default: DatabaseConnection) -> Self {
        Self {
            default,
            named: HashMap::new(),
        }
    }

    /// Register an additional named connection.
    pub fn with_named(mut self, name: impl Into<String>, conn: DatabaseConnection) -> Self {
        self.named.insert(name.into(), conn);
        self
    }

    /// The default connection.
    pub fn connection(&self) -> &DatabaseConnection {
        &self.default
    }

    /// Resolve a job's declared connection; `None` is the default.
    pub fn named(&self, name: Option<&str>) -> AppResult<&DatabaseConnection> {
        match name {
            None => Ok(&self.default),
            Some(name) => self
                .named
                .get(name)
                .ok_or_else(|| AppError::NotFound(format!("Connection '{}'", name))),
        }
    }

    /// Apply the bundled migrations (default table name) to the default connection.
    pub async fn run_migrations(&self) -> AppResult<()> {
        Migrator::up(&self.default, None)
            .await
            .map_err(|e| AppError::Database(format!("Migration failed: {}", e)))?;
        info!("Database migrations complete");
        Ok(())
    }
}

async fn connect(url: &str, max_connections: u32) -> AppResult<DatabaseConnection> {
    // In-memory SQLite databases exist per connection, so they get exactly one
    let max_connections = if url.contains(":memory:") {
        1
    } else {
        max_connections.max(1)
    };

    let mut options = ConnectOptions::new(url.to_string());
    options
        .max_connections(max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    Database::connect(options)
        .await
        .map_err(|e| AppError::Database(format!("Failed to connect to database: {}", e)))
}
