//! Integration tests for execution rows: insert, idempotency-key lookup,
//! optimistic status transitions, and terminal-status monotonicity.
//!
//! Requires PostgreSQL (testcontainers, or `MARSHAL_TEST_PG_URL`).

use marshal_db::models::{ExecutionMode, ExecutionStatus, SlaClass};
use marshal_db::queries::executions::{self, NewExecution};
use marshal_test_utils::TestDb;

fn sample_execution(tenant: &str, key: &str) -> NewExecution {
    NewExecution {
        tenant_id: tenant.to_owned(),
        actor_id: "actor-1".to_owned(),
        idempotency_key: key.to_owned(),
        plan_snapshot: serde_json::json!({"name": "p", "steps": []}),
        plan_hash: "abc123".to_owned(),
        execution_mode: ExecutionMode::Queued,
        sla_class: SlaClass::Medium,
        approval_level: 0,
        status: ExecutionStatus::Approved,
        timeout_at: None,
        trace_id: None,
        parent_execution_id: None,
        tags: serde_json::json!([]),
        metadata: serde_json::json!({}),
    }
}

#[tokio::test]
async fn insert_and_fetch_roundtrip() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let new = sample_execution("t1", "key-1");
    let exec = executions::insert_execution(&pool, &new)
        .await
        .expect("insert should succeed");
    assert_eq!(exec.status, ExecutionStatus::Approved);
    assert_eq!(exec.tenant_id, "t1");
    assert!(exec.completed_at.is_none());

    let fetched = executions::get_execution(&pool, exec.id)
        .await
        .unwrap()
        .expect("should exist");
    assert_eq!(fetched.id, exec.id);
    assert_eq!(fetched.plan_hash, "abc123");

    let by_key = executions::get_by_idempotency_key(&pool, "t1", "key-1")
        .await
        .unwrap()
        .expect("should be found by key");
    assert_eq!(by_key.id, exec.id);

    // Same key under a different tenant is not found.
    let other_tenant = executions::get_by_idempotency_key(&pool, "t2", "key-1")
        .await
        .unwrap();
    assert!(other_tenant.is_none());

    db.cleanup().await;
}

#[tokio::test]
async fn duplicate_idempotency_key_violates_unique_index() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let new = sample_execution("t1", "dup-key");
    executions::insert_execution(&pool, &new).await.unwrap();

    let err = executions::insert_execution(&pool, &new)
        .await
        .expect_err("second insert should fail");
    assert!(
        executions::is_unique_violation(&err),
        "expected unique violation, got: {err}"
    );

    db.cleanup().await;
}

#[tokio::test]
async fn optimistic_transition_sets_timestamps() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let exec = executions::insert_execution(&pool, &sample_execution("t1", "k1"))
        .await
        .unwrap();

    let rows = executions::transition_status(
        &pool,
        exec.id,
        ExecutionStatus::Approved,
        ExecutionStatus::Queued,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let rows = executions::transition_status(
        &pool,
        exec.id,
        ExecutionStatus::Queued,
        ExecutionStatus::Running,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let fetched = executions::get_execution(&pool, exec.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, ExecutionStatus::Running);
    assert_eq!(fetched.previous_status.as_deref(), Some("queued"));
    assert!(fetched.started_at.is_some(), "started_at set on running");
    assert!(fetched.completed_at.is_none());

    // Stale `from` affects zero rows.
    let rows = executions::transition_status(
        &pool,
        exec.id,
        ExecutionStatus::Queued,
        ExecutionStatus::Running,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 0, "stale transition should not apply");

    let rows = executions::transition_status(
        &pool,
        exec.id,
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let fetched = executions::get_execution(&pool, exec.id).await.unwrap().unwrap();
    assert!(fetched.completed_at.is_some(), "completed_at set on terminal");

    db.cleanup().await;
}

#[tokio::test]
async fn finalize_never_leaves_terminal_state() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let exec = executions::insert_execution(&pool, &sample_execution("t1", "k2"))
        .await
        .unwrap();

    // approved -> cancelled via finalize
    let rows = executions::finalize_status(
        &pool,
        exec.id,
        ExecutionStatus::Cancelled,
        Some("user_initiated"),
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    // A second finalize (e.g. a racing timeout) must not move the row.
    let rows = executions::finalize_status(
        &pool,
        exec.id,
        ExecutionStatus::TimedOut,
        Some("timeout"),
    )
    .await
    .unwrap();
    assert_eq!(rows, 0, "terminal status must be monotonic");

    let fetched = executions::get_execution(&pool, exec.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, ExecutionStatus::Cancelled);
    assert_eq!(fetched.error_message.as_deref(), Some("user_initiated"));

    db.cleanup().await;
}

#[tokio::test]
async fn list_filters_by_tenant_and_status() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    executions::insert_execution(&pool, &sample_execution("t1", "a")).await.unwrap();
    executions::insert_execution(&pool, &sample_execution("t1", "b")).await.unwrap();
    executions::insert_execution(&pool, &sample_execution("t2", "c")).await.unwrap();

    let t1 = executions::list_executions(&pool, "t1", None, 50).await.unwrap();
    assert_eq!(t1.len(), 2);

    let approved = executions::list_executions(&pool, "t1", Some(ExecutionStatus::Approved), 50)
        .await
        .unwrap();
    assert_eq!(approved.len(), 2);

    let running = executions::list_executions(&pool, "t1", Some(ExecutionStatus::Running), 50)
        .await
        .unwrap();
    assert!(running.is_empty());

    db.cleanup().await;
}
