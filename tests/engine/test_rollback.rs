//! Rollback selection and reverse-logic handling.

use data_jobs::error::AppError;
use data_jobs::models::JobStatus;
use data_jobs::services::{JobResolver, RollbackOptions, RunOptions};

use super::test_helpers::{insert_job, TestEnv};

fn last_batch() -> RollbackOptions {
    RollbackOptions::default()
}

#[tokio::test]
async fn test_rollback_walks_back_one_batch_at_a_time() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", true));
    env.orchestrator().run(RunOptions::default()).await.unwrap();
    env.write_job("2024_01_02_000000_b", &insert_job("b", true));
    env.orchestrator().run(RunOptions::default()).await.unwrap();

    let mut orchestrator = env.orchestrator();

    let first = orchestrator.rollback(last_batch()).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(JobResolver::derive_name(&first[0]), "2024_01_02_000000_b");
    assert_eq!(env.record("2024_01_02_000000_b").await.status, JobStatus::RolledBack);
    assert_eq!(env.event_labels().await, vec!["a"]);

    let second = orchestrator.rollback(last_batch()).await.unwrap();
    assert_eq!(JobResolver::derive_name(&second[0]), "2024_01_01_000000_a");
    assert!(env.event_labels().await.is_empty());

    let third = orchestrator.rollback(last_batch()).await.unwrap();
    assert!(third.is_empty());
    assert_eq!(orchestrator.notes(), ["Nothing to rollback."]);
}

#[tokio::test]
async fn test_rollback_runs_in_reverse_name_order() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", true));
    env.write_job("2024_01_02_000000_b", &insert_job("b", true));
    env.orchestrator().run(RunOptions::default()).await.unwrap();

    let mut orchestrator = env.orchestrator();
    orchestrator.rollback(last_batch()).await.unwrap();

    let rolling: Vec<&String> = orchestrator
        .notes()
        .iter()
        .filter(|n| n.starts_with("Rolling back: "))
        .collect();
    assert_eq!(
        rolling,
        vec![
            "Rolling back: 2024_01_02_000000_b",
            "Rolling back: 2024_01_01_000000_a"
        ]
    );
}

#[tokio::test]
async fn test_rolled_back_job_runs_again_with_one_record() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", true));
    env.orchestrator().run(RunOptions::default()).await.unwrap();
    env.orchestrator().rollback(last_batch()).await.unwrap();

    let ran = env.orchestrator().run(RunOptions::default()).await.unwrap();

    assert_eq!(ran.len(), 1);
    assert_eq!(env.record_count("2024_01_01_000000_a").await, 1);
    let record = env.record("2024_01_01_000000_a").await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.batch, 2);
}

#[tokio::test]
async fn test_irreversible_job_is_skipped() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", true));
    env.write_job("2024_01_02_000000_b", &insert_job("b", false));
    env.orchestrator().run(RunOptions::default()).await.unwrap();

    let mut orchestrator = env.orchestrator();
    let rolled_back = orchestrator
        .rollback(RollbackOptions {
            batch: Some(1),
            step: None,
        })
        .await
        .unwrap();

    assert_eq!(rolled_back.len(), 1);
    assert_eq!(JobResolver::derive_name(&rolled_back[0]), "2024_01_01_000000_a");
    assert_eq!(env.record("2024_01_02_000000_b").await.status, JobStatus::Completed);
    assert_eq!(env.event_labels().await, vec!["b"]);
    assert!(
        orchestrator
            .notes()
            .iter()
            .any(|n| n == "Skipping (not reversible): 2024_01_02_000000_b")
    );
}

#[tokio::test]
async fn test_missing_definition_file_is_skipped() {
    let env = TestEnv::new().await;
    env.write_job("2024_01_01_000000_a", &insert_job("a", true));
    env.write_job("2024_01_02_000000_b", &insert_job("b", true));
    env.orchestrator().run(RunOptions::default()).await.unwrap();
    env.remove_job("2024_01_02_000000_b");

    let mut orchestrator = env.orchestrator();
    let rolled_back = orchestrator.rollback(last_batch()).await.unwrap();

    assert_eq!(rolled_back.len(), 1);
    assert_eq!(env.record("2024_01_02_000000_b").await.status, JobStatus::Completed);
    assert_eq!(env.record("2024_01_01_000000_a").await.status, JobStatus::RolledBack);
    assert!(
        orchestrator
            .notes()
            .iter()
            .any(|n| n == "Job file not found: 2024_01_02_000000_b")
    );
}

#[tokio::test]
async fn test_step_rollback_takes_most_recent_records() {
    let env = TestEnv::new().await;
    for (i, label) in ["a", "b", "c"].iter().enumerate() {
        env.write_job(
            &format!("2024_01_0{}_000000_{}", i + 1, label),
            &insert_job(label, true),
        );
    }
    env.orchestrator().run(RunOptions::default()).await.unwrap();

    let rolled_back = env
        .orchestrator()
        .rollback(RollbackOptions {
            batch: None,
            step: Some(2),
        })
        .await
        .unwrap();

    let names: Vec<String> = rolled_back.iter().map(|f| JobResolver::derive_name(f)).collect();
    assert_eq!(names, vec!["2024_01_03_000000_c", "2024_01_02_000000_b"]);
    assert_eq!(env.event_labels().await, vec!["a"]);
}

#[tokio::test]
async fn test_failed_reverse_logic_leaves_record_completed() {
    let env = TestEnv::new().await;
    env.write_job(
        "2024_01_01_000000_a",
        "-- @tables: events\n-- +up\nINSERT INTO events (label) VALUES ('a');\n-- +down\nDELETE FROM missing_table;\n",
    );
    env.orchestrator().run(RunOptions::default()).await.unwrap();

    let mut orchestrator = env.orchestrator();
    let err = orchestrator.rollback(last_batch()).await.unwrap_err();

    assert!(matches!(err, AppError::Execution { ref name, .. } if name == "2024_01_01_000000_a"));
    assert_eq!(env.record("2024_01_01_000000_a").await.status, JobStatus::Completed);
    assert_eq!(env.event_labels().await, vec!["a"]);
    assert!(
        orchestrator
            .notes()
            .iter()
            .any(|n| n.starts_with("Rollback failed: 2024_01_01_000000_a - "))
    );
}

#[tokio::test]
async fn test_rollback_with_empty_store() {
    let env = TestEnv::new().await;
    let mut orchestrator = env.orchestrator();

    let rolled_back = orchestrator.rollback(last_batch()).await.unwrap();

    assert!(rolled_back.is_empty());
    assert_eq!(orchestrator.notes(), ["Nothing to rollback."]);
}
