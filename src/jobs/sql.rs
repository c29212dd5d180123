//! Self-contained SQL job definitions.
//!
//! ```sql
//! -- @description: Normalise user emails
//! -- @tables: users
//! -- @timeout: 120
//!
//! -- +up
//! UPDATE users SET email = lower(email);
//!
//! -- +down
//! -- (optional)
//! ```
//!
//! Header directives come before the first section. A non-empty `-- +down` section makes
//! the job reversible.

use async_trait::async_trait;
use sea_orm::ConnectionTrait;

use super::{DataJob, JobContext, JobTimeout};
use crate::error::{AppError, AppResult, JobError};

const UP_MARKER: &str = "-- +up";
const DOWN_MARKER: &str = "-- +down";
const DIRECTIVE_PREFIX: &str = "-- @";

/// Whether `content` is a self-contained definition.
pub fn is_inline(content: &str) -> bool {
    content.lines().any(|line| line.trim() == UP_MARKER)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlJob {
    up: String,
    down: Option<String>,
    description: String,
    tables: Vec<String>,
    transaction: bool,
    idempotent: bool,
    timeout: JobTimeout,
    connection: Option<String>,
    estimated_rows: Option<u64>,
}

enum Section {
    Header,
    Up,
    Down,
}

impl SqlJob {
    /// Parse a definition; `source` names it in error messages.
    pub fn parse(source: &str, content: &str) -> AppResult<Self> {
        let mut job = SqlJob {
            up: String::new(),
            down: None,
            description: String::new(),
            tables: Vec::new(),
            transaction: true,
            idempotent: false,
            timeout: JobTimeout::Default,
            connection: None,
            estimated_rows: None,
        };
        let mut down = String::new();
        let mut section = Section::Header;

        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed == UP_MARKER {
                section = Section::Up;
                continue;
            }
            if trimmed == DOWN_MARKER {
                section = Section::Down;
                continue;
            }

            match section {
                Section::Header => {
                    if let Some(directive) = trimmed.strip_prefix(DIRECTIVE_PREFIX) {
                        job.apply_directive(source, directive)?;
                    }
                }
                Section::Up => push_line(&mut job.up, line),
                Section::Down => push_line(&mut down, line),
            }
        }

        if job.up.trim().is_empty() {
            return Err(AppError::InvalidInput(format!(
                "{}: the {} section is empty",
                source, UP_MARKER
            )));
        }

        let down = down.trim();
        job.down = (!down.is_empty()).then(|| down.to_string());

        Ok(job)
    }

    fn apply_directive(&mut self, source: &str, directive: &str) -> AppResult<()> {
        let invalid = |detail: String| AppError::InvalidInput(format!("{}: {}", source, detail));

        let (key, value) = directive
            .split_once(':')
            .ok_or_else(|| invalid(format!("directive '@{}' has no value", directive)))?;
        let value = value.trim();

        match key.trim() {
            "description" => self.description = value.to_string(),
            "tables" => {
                self.tables = value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "transaction" => {
                self.transaction = parse_bool(value)
                    .ok_or_else(|| invalid(format!("invalid @transaction '{}'", value)))?;
            }
            "idempotent" => {
                self.idempotent = parse_bool(value)
                    .ok_or_else(|| invalid(format!("invalid @idempotent '{}'", value)))?;
            }
            "timeout" => {
                self.timeout = match value {
                    "default" => JobTimeout::Default,
                    "unlimited" => JobTimeout::Unlimited,
                    secs => JobTimeout::Seconds(
                        secs.parse()
                            .map_err(|_| invalid(format!("invalid @timeout '{}'", secs)))?,
                    ),
                };
            }
            "connection" => {
                self.connection = (!value.is_empty()).then(|| value.to_string());
            }
            "estimated_rows" => {
                self.estimated_rows = Some(
                    value
                        .parse()
                        .map_err(|_| invalid(format!("invalid @estimated_rows '{}'", value)))?,
                );
            }
            other => return Err(invalid(format!("unknown directive '@{}'", other))),
        }

        Ok(())
    }

    pub fn up_sql(&self) -> &str {
        &self.up
    }

    pub fn down_sql(&self) -> Option<&str> {
        self.down.as_deref()
    }
}

#[async_trait]
impl DataJob for SqlJob {
    async fn up(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let result = ctx.db().execute_unprepared(&self.up).await?;
        ctx.affected(result.rows_affected());
        Ok(())
    }

    async fn down(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let sql = self.down.as_deref().ok_or(JobError::NotReversible)?;
        let result = ctx.db().execute_unprepared(sql).await?;
        ctx.affected(result.rows_affected());
        Ok(())
    }

    fn reversible(&self) -> bool {
        self.down.is_some()
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn affected_tables(&self) -> Vec<String> {
        self.tables.clone()
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn within_transaction(&self) -> bool {
        self.transaction
    }

    fn timeout(&self) -> JobTimeout {
        self.timeout
    }

    fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    fn estimated_rows(&self) -> Option<u64> {
        self.estimated_rows
    }
}

fn push_line(buffer: &mut String, line: &str) {
    buffer.push_str(line);
    buffer.push('\n');
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
