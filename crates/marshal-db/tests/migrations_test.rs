//! Schema smoke tests: migrations apply cleanly and seed data is present.
//!
//! Requires PostgreSQL (testcontainers, or `MARSHAL_TEST_PG_URL`).

use marshal_db::models::{ActionClass, SlaClass};
use marshal_db::queries::policies;
use marshal_db::pool;
use marshal_test_utils::TestDb;

#[tokio::test]
async fn migrations_create_all_tables() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .expect("should list tables");

    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
    for expected in [
        "approvals",
        "asset_locks",
        "execution_dlq",
        "execution_events",
        "execution_queue",
        "execution_steps",
        "executions",
        "timeout_policies",
    ] {
        assert!(names.contains(&expected), "missing table {expected}: {names:?}");
    }

    db.cleanup().await;
}

#[tokio::test]
async fn store_summary_reflects_a_fresh_store() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let summary = pool::summarize(&pool).await.expect("summary should build");
    assert!(
        summary.schema_version > 0,
        "migrations must have been applied"
    );
    assert_eq!(summary.executions, 0);
    assert_eq!(summary.pending_queue, 0);
    assert_eq!(summary.unarchived_dead_letters, 0);
    assert_eq!(summary.active_locks, 0);

    db.cleanup().await;
}

#[tokio::test]
async fn timeout_policy_matrix_is_seeded() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let all = policies::list_policies(&pool).await.expect("should list");
    assert_eq!(all.len(), 9, "3 SLA classes x 3 action classes");

    let policy = policies::get_timeout_policy(&pool, SlaClass::Fast, ActionClass::Read)
        .await
        .expect("should query")
        .expect("fast/read cell should exist");
    assert_eq!(policy.step_timeout_seconds, 10);
    assert_eq!(policy.max_attempts, 2);

    let policy = policies::get_timeout_policy(&pool, SlaClass::Long, ActionClass::Complex)
        .await
        .expect("should query")
        .expect("long/complex cell should exist");
    assert_eq!(policy.step_timeout_seconds, 600);
    assert_eq!(policy.max_attempts, 5);

    db.cleanup().await;
}
