//! SeaORM database migrations.

pub use sea_orm_migration::prelude::*;

mod m20240101_000001_create_job_records;

pub use m20240101_000001_create_job_records::create_table as create_job_records_table;

/// Migrator for embedding the job record table (default table name) into an
/// application's own migration run.
pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20240101_000001_create_job_records::Migration::default())]
    }
}
