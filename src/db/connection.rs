//! Connection handle passed to job logic.
//!
//! A job runs either directly on a pooled connection or inside a transaction opened by
//! the orchestrator. Both are exposed through one `ConnectionTrait` implementation so
//! job code can use any SeaORM query against it.

use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, ExecResult,
    QueryResult, Statement,
};

#[derive(Clone, Copy)]
pub enum JobConnection<'a> {
    Pool(&'a DatabaseConnection),
    Transaction(&'a DatabaseTransaction),
}

impl JobConnection<'_> {
    pub fn in_transaction(&self) -> bool {
        matches!(self, JobConnection::Transaction(_))
    }
}

#[async_trait::async_trait]
impl ConnectionTrait for JobConnection<'_> {
    fn get_database_backend(&self) -> DbBackend {
        match self {
            JobConnection::Pool(conn) => conn.get_database_backend(),
            JobConnection::Transaction(txn) => txn.get_database_backend(),
        }
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        match self {
            JobConnection::Pool(conn) => conn.execute(stmt).await,
            JobConnection::Transaction(txn) => txn.execute(stmt).await,
        }
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        match self {
            JobConnection::Pool(conn) => conn.execute_unprepared(sql).await,
            JobConnection::Transaction(txn) => txn.execute_unprepared(sql).await,
        }
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        match self {
            JobConnection::Pool(conn) => conn.query_one(stmt).await,
            JobConnection::Transaction(txn) => txn.query_one(stmt).await,
        }
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        match self {
            JobConnection::Pool(conn) => conn.query_all(stmt).await,
            JobConnection::Transaction(txn) => txn.query_all(stmt).await,
        }
    }
}
