//! Data jobs library.
//!
//! Runs one-off data transformation jobs in timestamp order, records every run in a
//! job record table, and rolls batches back through each job's reverse logic.

pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod jobs;
pub mod migration;
pub mod models;
pub mod services;
