//! Forward runs: ordering, batching, failure handling and retries.

use std::path::PathBuf;
use std::sync::Arc;

use data_jobs::config::TransactionMode;
use data_jobs::error::{AppError, JobError};
use data_jobs::models::JobStatus;
use data_jobs::services::{JobResolver, RunOptions};

use super::test_helpers::{
    events_database, insert_job, labels, RecordingBackup, TestEnv, REGISTERED,
};

fn names(files: &[PathBuf]) -> Vec<String> {
    files.iter().map(|f| JobResolver::derive_name(f)).collect()
}

#[tokio::test]
async fn test_runs_pending_jobs_in_order_with_one_batch() {
    let env = TestEnv::new().await;
    env.write_job("2024_02_01_000000_second", &insert_job("second", false));
    env.write_job("2024_01_01_000000_first", &insert_job("first", false));

    let mut orchestrator = env.orchestrator();
    let ran = orchestrator.run(RunOptions::default()).await.unwrap();

    assert_eq!(
        names(&ran),
        vec!["2024_01_01_000000_first", "2024_02_01_000000_second"]
    );
    assert_eq!(env.event_labels().await, vec!["first", "second"]);

    for name in ["2024_01_01_000000_first", "2024_02_01_000000_second"] {
        let record = env.record(name).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.batch, 1);
        assert_eq!(record.rows_affected, Some(1));
        assert!(record.duration_ms.unwrap_or(0) > 0);
        assert!(record.description().is_some_and(|d| d.starts_with("insert")));
    }
}

#[tokio::test]
async fn test_nothing_to_migrate() {
    let env = TestEnv::new().await;
    let mut orchestrator = env.orchestrator();

    let ran = orchestrator.run(RunOptions::default()).await.unwrap();

    assert!(ran.is_empty());
    assert_eq!(orchestrator.notes(), ["Nothing to migrate."]);
}

#[tokio::test]
async fn test_second_run_only_runs_new_jobs() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", false));
    env.orchestrator().run(RunOptions::default()).await.unwrap();

    env.write_job("2024_01_02_000000_b", &insert_job("b", false));
    let ran = env.orchestrator().run(RunOptions::default()).await.unwrap();

    assert_eq!(names(&ran), vec!["2024_01_02_000000_b"]);
    assert_eq!(env.record("2024_01_02_000000_b").await.batch, 2);
    assert_eq!(env.event_labels().await, vec!["a", "b"]);
}

#[tokio::test]
async fn test_failure_is_recorded_and_stops_the_batch() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", false));
    env.write_job("2024_01_02_000000_flaky_import", REGISTERED);
    env.write_job("2024_01_03_000000_c", &insert_job("c", false));
    env.fail_jobs(true);

    let mut orchestrator = env.orchestrator();
    let err = orchestrator.run(RunOptions::default()).await.unwrap_err();

    match err {
        AppError::Execution { name, source } => {
            assert_eq!(name, "2024_01_02_000000_flaky_import");
            assert!(matches!(source, JobError::Failed(ref msg) if msg == "boom"));
        }
        other => panic!("expected execution error, got {:?}", other),
    }

    let failed = env.record("2024_01_02_000000_flaky_import").await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("boom"));

    assert_eq!(env.record("2024_01_01_000000_a").await.status, JobStatus::Completed);
    assert_eq!(env.record_count("2024_01_03_000000_c").await, 0);

    // The failing job's partial write was rolled back with its transaction
    assert_eq!(env.event_labels().await, vec!["a"]);
    assert!(
        orchestrator
            .notes()
            .iter()
            .any(|n| n == "Failed: 2024_01_02_000000_flaky_import - boom")
    );
}

#[tokio::test]
async fn test_without_transaction_partial_writes_remain() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_flaky_import", REGISTERED);
    env.fail_jobs(true);

    let mut settings = env.settings();
    settings.transaction = TransactionMode::Never;
    let mut orchestrator =
        env.orchestrator_with(settings, Arc::new(RecordingBackup::new(false, false)));

    assert!(orchestrator.run(RunOptions::default()).await.is_err());
    assert_eq!(env.event_labels().await, vec!["partial"]);
}

#[tokio::test]
async fn test_retry_after_failure_keeps_one_record() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_flaky_import", REGISTERED);
    env.write_job("2024_01_02_000000_b", &insert_job("b", false));

    env.fail_jobs(true);
    assert!(env.orchestrator().run(RunOptions::default()).await.is_err());

    env.fail_jobs(false);
    let ran = env.orchestrator().run(RunOptions::default()).await.unwrap();

    assert_eq!(
        names(&ran),
        vec!["2024_01_01_000000_flaky_import", "2024_01_02_000000_b"]
    );
    assert_eq!(env.record_count("2024_01_01_000000_flaky_import").await, 1);

    let retried = env.record("2024_01_01_000000_flaky_import").await;
    assert_eq!(retried.status, JobStatus::Completed);
    assert_eq!(retried.batch, 2);
    assert!(retried.error_message.is_none());
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", true));

    let mut orchestrator = env.orchestrator();
    let previewed = orchestrator
        .run(RunOptions {
            dry_run: true,
            step: false,
        })
        .await
        .unwrap();

    assert_eq!(names(&previewed), vec!["2024_01_01_000000_a"]);
    assert_eq!(env.record_count("2024_01_01_000000_a").await, 0);
    assert!(env.event_labels().await.is_empty());

    let notes = orchestrator.notes();
    assert!(notes.iter().any(|n| n == "[DRY RUN] 2024_01_01_000000_a"));
    assert!(notes.iter().any(|n| n == "  Affected tables: events"));
    assert!(notes.iter().any(|n| n == "  Reversible: Yes"));
    assert!(notes.iter().any(|n| n == "  Estimated rows: Unknown"));
}

#[tokio::test]
async fn test_failed_and_rolled_back_jobs_are_pending() {
    let env = TestEnv::new().await;
    let repo = env.repository();
    for name in ["a", "b", "c", "d"] {
        env.write_job(&format!("2024_01_01_000000_{}", name), &insert_job(name, false));
    }

    repo.log_start("2024_01_01_000000_a", 1).await.unwrap();
    repo.log_complete("2024_01_01_000000_a", 0, 1, &Default::default())
        .await
        .unwrap();
    repo.log_start("2024_01_01_000000_b", 1).await.unwrap();
    repo.log_failed("2024_01_01_000000_b", "boom").await.unwrap();
    repo.log_start("2024_01_01_000000_c", 1).await.unwrap();
    repo.log_rollback("2024_01_01_000000_c").await.unwrap();

    let pending = env.orchestrator().pending_jobs().await.unwrap();
    assert_eq!(
        names(&pending),
        vec![
            "2024_01_01_000000_b",
            "2024_01_01_000000_c",
            "2024_01_01_000000_d"
        ]
    );
}

#[tokio::test]
async fn test_missing_record_table_fails_before_any_write() {
    let env = TestEnv::bare().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", false));

    let err = env
        .orchestrator()
        .run(RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::MissingRepository(ref table) if table == "data_jobs"));
    assert!(!env.repository().repository_exists().await.unwrap());
    assert!(env.event_labels().await.is_empty());
}

#[tokio::test]
async fn test_timeout_fails_the_job() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_slow_backfill", REGISTERED);

    let err = env
        .orchestrator()
        .run(RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::Execution {
            source: JobError::Timeout(1),
            ..
        }
    ));

    let record = env.record("2024_01_01_000000_slow_backfill").await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("Job exceeded the timeout limit of 1 seconds")
    );
}

#[tokio::test]
async fn test_timeout_during_slow_statement_records_failure() {
    let env = TestEnv::new().await;
    env.write_job(
        "2024_01_01_000000_bulk_insert",
        "-- @timeout: 1\n-- @tables: events\n-- +up\n\
         INSERT INTO events (label) SELECT 'bulk' FROM \
         (WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 30000000) \
         SELECT count(*) AS n FROM c);\n",
    );

    let mut orchestrator = env.orchestrator();
    let err = orchestrator.run(RunOptions::default()).await.unwrap_err();

    assert!(matches!(
        err,
        AppError::Execution {
            source: JobError::Timeout(1),
            ..
        }
    ));

    let record = env.record("2024_01_01_000000_bulk_insert").await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("Job exceeded the timeout limit of 1 seconds")
    );
    assert!(env.event_labels().await.is_empty());
    assert_eq!(
        names(&orchestrator.pending_jobs().await.unwrap()),
        vec!["2024_01_01_000000_bulk_insert"]
    );
}

#[tokio::test]
async fn test_failure_that_cannot_be_recorded_is_reported() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_drop_ledger", REGISTERED);

    let mut orchestrator = env.orchestrator();
    let err = orchestrator.run(RunOptions::default()).await.unwrap_err();

    match err {
        AppError::UnrecordedFailure {
            ref name,
            ref source,
            ..
        } => {
            assert_eq!(name, "2024_01_01_000000_drop_ledger");
            assert_eq!(source.to_string(), "ledger gone");
        }
        other => panic!("expected an unrecorded failure, got {:?}", other),
    }
    assert!(
        orchestrator
            .notes()
            .iter()
            .any(|n| n == "Failed: 2024_01_01_000000_drop_ledger - ledger gone")
    );
}

#[tokio::test]
async fn test_named_connection_receives_job_writes() {
    let env = TestEnv::new().await;
    let (_legacy_file, legacy) = events_database().await;
    env.write_job(
        "2024_01_01_000000_legacy_insert",
        "-- @connection: legacy\n-- +up\nINSERT INTO events (label) VALUES ('legacy');\n",
    );

    let pool = env
        .pool
        .clone()
        .with_named("legacy", legacy.connection().clone());
    let ran = env
        .orchestrator_on(pool)
        .run(RunOptions::default())
        .await
        .unwrap();

    assert_eq!(ran.len(), 1);
    assert_eq!(labels(legacy.connection()).await, vec!["legacy"]);
    assert!(env.event_labels().await.is_empty());

    let record = env.record("2024_01_01_000000_legacy_insert").await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.rows_affected, Some(1));
}

#[tokio::test]
async fn test_unknown_connection_fails_the_job() {
    let env = TestEnv::new().await;
    env.write_job(
        "2024_01_01_000000_orphan",
        "-- @connection: missing\n-- +up\nINSERT INTO events (label) VALUES ('orphan');\n",
    );

    let err = env
        .orchestrator()
        .run(RunOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.failed_job(), Some("2024_01_01_000000_orphan"));
    let record = env.record("2024_01_01_000000_orphan").await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("Connection 'missing' not found")
    );
    assert!(env.event_labels().await.is_empty());
}

#[tokio::test]
async fn test_unlimited_timeout_ignores_default() {
    let env = TestEnv::new().await;
    env.write_job(
        "2024_01_01_000000_a",
        "-- @timeout: unlimited\n-- +up\nINSERT INTO events (label) VALUES ('a');\n",
    );

    let mut settings = env.settings();
    settings.timeout_secs = 1;
    let mut orchestrator =
        env.orchestrator_with(settings, Arc::new(RecordingBackup::new(false, false)));

    orchestrator.run(RunOptions::default()).await.unwrap();
    assert_eq!(env.event_labels().await, vec!["a"]);
}

#[tokio::test]
async fn test_step_mode_gives_each_job_a_batch() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", true));
    env.write_job("2024_01_02_000000_b", &insert_job("b", true));

    env.orchestrator()
        .run(RunOptions {
            dry_run: false,
            step: true,
        })
        .await
        .unwrap();

    assert_eq!(env.record("2024_01_01_000000_a").await.batch, 1);
    assert_eq!(env.record("2024_01_02_000000_b").await.batch, 2);
}

#[tokio::test]
async fn test_chunk_helpers_report_rows() {
    let env = TestEnv::new().await;
    env.seed_events(5).await;
    env.write_job("2024_01_01_000000_count_events", REGISTERED);
    env.write_job("2024_01_02_000000_mark_events", REGISTERED);

    env.orchestrator().run(RunOptions::default()).await.unwrap();

    assert_eq!(
        env.record("2024_01_01_000000_count_events").await.rows_affected,
        Some(5)
    );
    assert_eq!(
        env.record("2024_01_02_000000_mark_events").await.rows_affected,
        Some(5)
    );
    assert!(env.event_labels().await.iter().all(|l| l == "done"));
}

#[tokio::test]
async fn test_auto_backup_runs_for_jobs_with_tables() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", false));
    env.write_job(
        "2024_01_02_000000_no_tables",
        "-- +up\nINSERT INTO events (label) VALUES ('b');\n",
    );

    let backup = Arc::new(RecordingBackup::new(true, true));
    let mut settings = env.settings();
    settings.safety.auto_backup = true;
    let mut orchestrator = env.orchestrator_with(settings, backup.clone());

    orchestrator.run(RunOptions::default()).await.unwrap();

    assert_eq!(
        backup.calls(),
        vec![(vec!["events".to_string()], "2024_01_01_000000_a".to_string())]
    );
    assert!(
        orchestrator
            .notes()
            .iter()
            .any(|n| n == "Backup created successfully.")
    );
}

#[tokio::test]
async fn test_backup_problems_do_not_stop_jobs() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", false));

    let mut settings = env.settings();
    settings.safety.auto_backup = true;

    let unavailable = Arc::new(RecordingBackup::new(false, false));
    let mut orchestrator = env.orchestrator_with(settings.clone(), unavailable.clone());
    orchestrator.run(RunOptions::default()).await.unwrap();
    assert!(unavailable.calls().is_empty());
    assert!(
        orchestrator
            .notes()
            .iter()
            .any(|n| n == "Auto backup enabled but backup service not available.")
    );

    env.write_job("2024_01_02_000000_b", &insert_job("b", false));
    let failing = Arc::new(RecordingBackup::new(true, false));
    let mut orchestrator = env.orchestrator_with(settings, failing.clone());
    orchestrator.run(RunOptions::default()).await.unwrap();
    assert_eq!(failing.calls().len(), 1);
    assert!(
        orchestrator
            .notes()
            .iter()
            .any(|n| n == "Backup failed, continuing with job...")
    );

    assert_eq!(env.event_labels().await, vec!["a", "b"]);
}
