//! SeaORM row definitions.

pub mod job_record;
