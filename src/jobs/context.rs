//! Per-invocation context handed to job logic.
//!
//! Holds the connection the job must use (pool or orchestrator transaction), the
//! rows-affected counter the orchestrator reads afterwards, and the chunking helpers
//! that keep large-table jobs memory bounded.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::{self, Stream, TryStreamExt};
use sea_orm::sea_query::{Alias, Asterisk, Condition, Expr, Order, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, QueryResult, Value};
use tracing::info;

use super::ProgressTracker;
use crate::config::LoggingConfig;
use crate::db::JobConnection;
use crate::error::JobError;

const ID_COLUMN: &str = "id";

pub struct JobContext<'a> {
    db: JobConnection<'a>,
    job: &'a str,
    chunk_size: u64,
    logging: &'a LoggingConfig,
    rows_affected: AtomicU64,
    progress: ProgressTracker,
}

impl<'a> JobContext<'a> {
    pub fn new(
        db: JobConnection<'a>,
        job: &'a str,
        chunk_size: u64,
        logging: &'a LoggingConfig,
    ) -> Self {
        Self {
            db,
            job,
            chunk_size: chunk_size.max(1),
            logging,
            rows_affected: AtomicU64::new(0),
            progress: ProgressTracker::new(),
        }
    }

    /// Connection for the job's own queries.
    pub fn db(&self) -> JobConnection<'a> {
        self.db
    }

    /// Name of the running job.
    pub fn job_name(&self) -> &str {
        self.job
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Add to the rows-affected counter.
    pub fn affected(&self, count: u64) {
        self.rows_affected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Emit a job-authored message on the configured channel.
    pub fn log(&self, message: impl AsRef<str>) {
        if self.logging.enabled {
            info!(
                channel = %self.logging.channel,
                job = %self.job,
                "[DataJob] {}",
                message.as_ref()
            );
        }
    }

    /// Visit every row of `table` in pages ordered by `id`.
    ///
    /// Returns the number of rows visited.
    pub async fn chunk<F, Fut>(
        &self,
        table: &str,
        size: Option<u64>,
        mut callback: F,
    ) -> Result<u64, JobError>
    where
        F: FnMut(QueryResult) -> Fut + Send,
        Fut: Future<Output = Result<(), JobError>> + Send,
    {
        let size = self.page_size(size);
        let backend = self.db.get_database_backend();
        let mut offset = 0;
        let mut processed = 0;

        loop {
            let stmt = Query::select()
                .column(Asterisk)
                .from(Alias::new(table))
                .order_by(Alias::new(ID_COLUMN), Order::Asc)
                .limit(size)
                .offset(offset)
                .to_owned();

            let rows = self.db.query_all(backend.build(&stmt)).await?;
            let fetched = rows.len() as u64;

            for row in rows {
                callback(row).await?;
                processed += 1;
                self.progress.increment();
            }

            if fetched < size {
                break;
            }
            offset += size;
        }

        Ok(processed)
    }

    /// Stream the rows of `table` ordered by `id`, holding at most one page in memory.
    ///
    /// Pages are fetched by keyset (`id > last`), so rows inserted behind the cursor
    /// are not revisited.
    pub fn lazy<'s>(
        &'s self,
        table: &'s str,
        size: Option<u64>,
    ) -> impl Stream<Item = Result<QueryResult, JobError>> + Send + 's {
        let size = self.page_size(size);
        let db = self.db;

        stream::try_unfold((None::<i64>, false), move |(last_id, done)| async move {
            if done {
                return Ok::<_, JobError>(None);
            }

            let mut stmt = Query::select()
                .column(Asterisk)
                .from(Alias::new(table))
                .order_by(Alias::new(ID_COLUMN), Order::Asc)
                .limit(size)
                .to_owned();
            if let Some(last_id) = last_id {
                stmt.and_where(Expr::col(Alias::new(ID_COLUMN)).gt(last_id));
            }

            let rows = db.query_all(db.get_database_backend().build(&stmt)).await?;
            let Some(last) = rows.last() else {
                return Ok(None);
            };
            let last_id = last.try_get::<i64>("", ID_COLUMN)?;
            let done = (rows.len() as u64) < size;

            Ok(Some((rows, (Some(last_id), done))))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, JobError>)))
        .try_flatten()
    }

    /// `chunk` over the keyset stream from `lazy`.
    pub async fn chunk_lazy<F, Fut>(
        &self,
        table: &str,
        size: Option<u64>,
        mut callback: F,
    ) -> Result<u64, JobError>
    where
        F: FnMut(QueryResult) -> Fut + Send,
        Fut: Future<Output = Result<(), JobError>> + Send,
    {
        let mut rows = std::pin::pin!(self.lazy(table, size));
        let mut processed = 0;

        while let Some(row) = rows.try_next().await? {
            callback(row).await?;
            processed += 1;
            self.progress.increment();
        }

        Ok(processed)
    }

    /// Apply `updates` to rows matching `condition`, at most `size` rows per statement,
    /// until a statement affects nothing. Returns the total affected.
    ///
    /// `condition` must stop matching rows once they are updated, otherwise this never ends.
    pub async fn chunk_update(
        &self,
        table: &str,
        updates: &[(&str, Value)],
        condition: Condition,
        size: Option<u64>,
    ) -> Result<u64, JobError> {
        let size = self.page_size(size);
        let backend = self.db.get_database_backend();
        let mut total = 0;

        loop {
            let page = Query::select()
                .column(Alias::new(ID_COLUMN))
                .from(Alias::new(table))
                .cond_where(condition.clone())
                .limit(size)
                .to_owned();

            let stmt = Query::update()
                .table(Alias::new(table))
                .values(
                    updates
                        .iter()
                        .map(|(column, value)| (Alias::new(*column), SimpleExpr::from(value.clone()))),
                )
                .and_where(Expr::col(Alias::new(ID_COLUMN)).in_subquery(page))
                .to_owned();

            let affected = self.db.execute(backend.build(&stmt)).await?.rows_affected();
            total += affected;
            self.progress.add(affected);

            if affected == 0 {
                break;
            }
        }

        Ok(total)
    }

    fn page_size(&self, size: Option<u64>) -> u64 {
        size.unwrap_or(self.chunk_size).max(1)
    }
}
