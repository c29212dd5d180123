//! Runner configuration loaded from environment variables.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

/// Development default values - NEVER use in production.
pub mod defaults {
    pub const DEV_DATABASE_URL: &str = "sqlite://data/data-jobs.db?mode=rwc";
    pub const MAX_CONNECTIONS: u32 = 5;
    pub const JOBS_PATH: &str = "database/data-jobs";
    pub const TABLE: &str = "data_jobs";
    pub const CHUNK_SIZE: u64 = 1000;
    pub const TIMEOUT_SECS: u64 = 0; // 0 = unlimited
    pub const LOG_CHANNEL: &str = "data_jobs";
    pub const CONFIRM_THRESHOLD: u64 = 10_000;
    pub const BACKUP_DIR: &str = "backups";
    pub const BACKUP_KEEP: usize = 5;
}

/// Runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Parse environment from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    /// Check if this is a production environment.
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// How job logic is wrapped in a datastore transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Defer to the job's own preference
    #[default]
    Auto,
    Always,
    Never,
}

impl TransactionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "always" => Some(Self::Always),
            "never" => Some(Self::Never),
            _ => None,
        }
    }

    /// Resolve the mode against a job's declared preference.
    pub fn should_wrap(&self, job_prefers_transaction: bool) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto => job_prefers_transaction,
        }
    }
}

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Default connection URL
    pub url: String,
    /// Additional named connections jobs may target
    pub connections: BTreeMap<String, String>,
    /// Pool size per connection
    pub max_connections: u32,
}

/// Job-authored log output.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub channel: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: defaults::LOG_CHANNEL.to_string(),
        }
    }
}

/// Safety features to prevent accidental data loss.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Require --force (or confirmation) in production
    pub require_force_in_production: bool,
    /// Estimated rows above which the CLI asks for confirmation (0 = never)
    pub confirm_threshold: u64,
    /// Back up affected tables before each job
    pub auto_backup: bool,
    /// Where backup archives are written
    pub backup_dir: PathBuf,
    /// Number of archives to keep (0 = keep all)
    pub backup_keep: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            require_force_in_production: true,
            confirm_threshold: defaults::CONFIRM_THRESHOLD,
            auto_backup: false,
            backup_dir: PathBuf::from(defaults::BACKUP_DIR),
            backup_keep: defaults::BACKUP_KEEP,
        }
    }
}

/// Settings consumed by the resolver, repository and orchestrator.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Directory holding job definition files
    pub path: PathBuf,
    /// Record table name
    pub table: String,
    /// Default chunk size for chunked helpers
    pub chunk_size: u64,
    /// Default timeout in seconds (0 = unlimited)
    pub timeout_secs: u64,
    pub transaction: TransactionMode,
    pub logging: LoggingConfig,
    pub safety: SafetyConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(defaults::JOBS_PATH),
            table: defaults::TABLE.to_string(),
            chunk_size: defaults::CHUNK_SIZE,
            timeout_secs: defaults::TIMEOUT_SECS,
            transaction: TransactionMode::Auto,
            logging: LoggingConfig::default(),
            safety: SafetyConfig::default(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Runtime environment
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub jobs: JobsConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RUST_ENV`: Environment (development/production, default: development)
    /// - `DATABASE_URL`: Default connection URL (required in production)
    /// - `DATA_JOBS_CONNECTIONS`: Extra named connections as `name=url,name=url`
    /// - `DATA_JOBS_MAX_CONNECTIONS`: Pool size (default: 5)
    /// - `DATA_JOBS_PATH`: Job definition directory (default: database/data-jobs)
    /// - `DATA_JOBS_TABLE`: Record table name (default: data_jobs)
    /// - `DATA_JOBS_CHUNK_SIZE`: Default chunk size (default: 1000)
    /// - `DATA_JOBS_TIMEOUT`: Default timeout in seconds, 0 = unlimited (default: 0)
    /// - `DATA_JOBS_TRANSACTION`: auto/always/never (default: auto)
    /// - `DATA_JOBS_LOGGING`: Enable job log output (default: true)
    /// - `DATA_JOBS_LOG_CHANNEL`: Channel attached to job log output (default: data_jobs)
    /// - `DATA_JOBS_REQUIRE_FORCE_IN_PRODUCTION`: (default: true)
    /// - `DATA_JOBS_CONFIRM_THRESHOLD`: Row confirmation threshold (default: 10000)
    /// - `DATA_JOBS_AUTO_BACKUP`: Back up affected tables before each job (default: false)
    /// - `DATA_JOBS_BACKUP_DIR`: Backup directory (default: backups)
    /// - `DATA_JOBS_BACKUP_KEEP`: Archives to keep, 0 = keep all (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup("RUST_ENV") {
            Some(value) => Environment::parse(&value).ok_or(ConfigError::InvalidValue(
                "RUST_ENV must be 'development' or 'production'",
            ))?,
            None => Environment::Development,
        };

        let url = lookup("DATABASE_URL").unwrap_or_else(|| defaults::DEV_DATABASE_URL.to_string());

        let connections = match lookup("DATA_JOBS_CONNECTIONS") {
            Some(raw) => parse_connections(&raw)?,
            None => BTreeMap::new(),
        };

        let max_connections = parse_or(
            &lookup,
            "DATA_JOBS_MAX_CONNECTIONS",
            defaults::MAX_CONNECTIONS,
            "DATA_JOBS_MAX_CONNECTIONS must be a valid number",
        )?;

        let path = lookup("DATA_JOBS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(defaults::JOBS_PATH));
        let table = lookup("DATA_JOBS_TABLE").unwrap_or_else(|| defaults::TABLE.to_string());

        let chunk_size = parse_or(
            &lookup,
            "DATA_JOBS_CHUNK_SIZE",
            defaults::CHUNK_SIZE,
            "DATA_JOBS_CHUNK_SIZE must be a valid number",
        )?;
        if chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "DATA_JOBS_CHUNK_SIZE must be greater than zero",
            ));
        }

        let timeout_secs = parse_or(
            &lookup,
            "DATA_JOBS_TIMEOUT",
            defaults::TIMEOUT_SECS,
            "DATA_JOBS_TIMEOUT must be a valid number of seconds",
        )?;

        let transaction = match lookup("DATA_JOBS_TRANSACTION") {
            Some(value) => TransactionMode::parse(&value).ok_or(ConfigError::InvalidValue(
                "DATA_JOBS_TRANSACTION must be 'auto', 'always' or 'never'",
            ))?,
            None => TransactionMode::Auto,
        };

        let logging = LoggingConfig {
            enabled: parse_flag(&lookup, "DATA_JOBS_LOGGING", true)?,
            channel: lookup("DATA_JOBS_LOG_CHANNEL")
                .unwrap_or_else(|| defaults::LOG_CHANNEL.to_string()),
        };

        let safety = SafetyConfig {
            require_force_in_production: parse_flag(
                &lookup,
                "DATA_JOBS_REQUIRE_FORCE_IN_PRODUCTION",
                true,
            )?,
            confirm_threshold: parse_or(
                &lookup,
                "DATA_JOBS_CONFIRM_THRESHOLD",
                defaults::CONFIRM_THRESHOLD,
                "DATA_JOBS_CONFIRM_THRESHOLD must be a valid number",
            )?,
            auto_backup: parse_flag(&lookup, "DATA_JOBS_AUTO_BACKUP", false)?,
            backup_dir: lookup("DATA_JOBS_BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(defaults::BACKUP_DIR)),
            backup_keep: parse_or(
                &lookup,
                "DATA_JOBS_BACKUP_KEEP",
                defaults::BACKUP_KEEP,
                "DATA_JOBS_BACKUP_KEEP must be a valid number",
            )?,
        };

        let config = Config {
            environment,
            database: DatabaseConfig {
                url,
                connections,
                max_connections,
            },
            jobs: JobsConfig {
                path,
                table,
                chunk_size,
                timeout_secs,
                transaction,
                logging,
                safety,
            },
        };

        if environment.is_production() {
            config.validate_production()?;
        }

        Ok(config)
    }

    /// Validate that production configuration does not use development defaults.
    fn validate_production(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.database.url == defaults::DEV_DATABASE_URL {
            errors.push(format!(
                "DATABASE_URL is using development default '{}'. Set a production database URL.",
                defaults::DEV_DATABASE_URL
            ));
        }

        if !errors.is_empty() {
            return Err(ConfigError::ProductionValidation(errors));
        }

        Ok(())
    }

    /// Whether destructive commands need --force or confirmation.
    pub fn requires_confirmation(&self) -> bool {
        self.environment.is_production() && self.jobs.safety.require_force_in_production
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T, message: &'static str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(message)),
        None => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::InvalidFlag(key.to_string())),
        },
        None => Ok(default),
    }
}

/// Parse `name=url,name=url` into named connections.
fn parse_connections(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut connections = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, url) = entry.split_once('=').ok_or(ConfigError::InvalidValue(
            "DATA_JOBS_CONNECTIONS entries must look like name=url",
        ))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::InvalidValue(
                "DATA_JOBS_CONNECTIONS entries need a connection name",
            ));
        }
        connections.insert(name.to_string(), url.trim().to_string());
    }
    Ok(connections)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(&'static str),

    #[error("Invalid boolean for {0}: use true/false")]
    InvalidFlag(String),

    #[error("Production configuration validation failed:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    ProductionValidation(Vec<String>),
}
