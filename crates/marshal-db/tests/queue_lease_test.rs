//! Integration tests for the lease-based queue: claim exclusivity, ordering,
//! retry accounting, and the dead-letter move.
//!
//! Requires PostgreSQL (testcontainers, or `MARSHAL_TEST_PG_URL`).

use uuid::Uuid;

use marshal_db::models::{ExecutionMode, ExecutionStatus, QueueStatus, SlaClass};
use marshal_db::queries::executions::{self, NewExecution};
use marshal_db::queries::{dlq, queue};
use marshal_test_utils::TestDb;

async fn seed_execution(pool: &sqlx::PgPool, key: &str) -> Uuid {
    let exec = executions::insert_execution(
        pool,
        &NewExecution {
            tenant_id: "t1".to_owned(),
            actor_id: "actor-1".to_owned(),
            idempotency_key: key.to_owned(),
            plan_snapshot: serde_json::json!({"name": "p", "steps": []}),
            plan_hash: "h".to_owned(),
            execution_mode: ExecutionMode::Queued,
            sla_class: SlaClass::Medium,
            approval_level: 0,
            status: ExecutionStatus::Queued,
            timeout_at: None,
            trace_id: None,
            parent_execution_id: None,
            tags: serde_json::json!([]),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .expect("execution insert should succeed");
    exec.id
}

#[tokio::test]
async fn dequeue_respects_priority_then_fifo() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let low = seed_execution(&pool, "low").await;
    let high = seed_execution(&pool, "high").await;
    let mid = seed_execution(&pool, "mid").await;

    queue::enqueue(&pool, low, 9, SlaClass::Long, 5, 300).await.unwrap();
    queue::enqueue(&pool, high, 1, SlaClass::Fast, 2, 300).await.unwrap();
    queue::enqueue(&pool, mid, 5, SlaClass::Medium, 3, 300).await.unwrap();

    let items = queue::dequeue_batch(&pool, Uuid::new_v4(), 300, 10).await.unwrap();
    let order: Vec<Uuid> = items.iter().map(|i| i.execution_id).collect();
    assert_eq!(order, vec![high, mid, low]);
    assert!(items.iter().all(|i| i.status == QueueStatus::Processing));
    assert!(items.iter().all(|i| i.lease_token.is_some()));

    db.cleanup().await;
}

#[tokio::test]
async fn concurrent_dequeues_never_share_an_item() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    for i in 0..4 {
        let id = seed_execution(&pool, &format!("c{i}")).await;
        queue::enqueue(&pool, id, 5, SlaClass::Medium, 3, 300).await.unwrap();
    }

    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let a = tokio::spawn(async move {
        queue::dequeue_batch(&pool_a, Uuid::new_v4(), 300, 4).await.unwrap()
    });
    let b = tokio::spawn(async move {
        queue::dequeue_batch(&pool_b, Uuid::new_v4(), 300, 4).await.unwrap()
    });

    let (items_a, items_b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(items_a.len() + items_b.len(), 4, "all items claimed exactly once");

    let mut seen: Vec<Uuid> = items_a.iter().chain(items_b.iter()).map(|i| i.id).collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 4, "no item handed to two workers");

    db.cleanup().await;
}

#[tokio::test]
async fn complete_requires_matching_lease_token() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let exec = seed_execution(&pool, "tok").await;
    queue::enqueue(&pool, exec, 5, SlaClass::Medium, 3, 300).await.unwrap();

    let token = Uuid::new_v4();
    let items = queue::dequeue_batch(&pool, token, 300, 1).await.unwrap();
    let item = &items[0];

    // Wrong token: no effect.
    let rows = queue::complete(&pool, item.id, Uuid::new_v4()).await.unwrap();
    assert_eq!(rows, 0, "foreign token must not complete the item");

    // Correct token: completes.
    let rows = queue::complete(&pool, item.id, token).await.unwrap();
    assert_eq!(rows, 1);

    let fetched = queue::get_item(&pool, item.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, QueueStatus::Completed);
    assert!(fetched.completed_at.is_some());

    db.cleanup().await;
}

#[tokio::test]
async fn renew_only_extends_owned_processing_items() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let exec = seed_execution(&pool, "renew").await;
    queue::enqueue(&pool, exec, 5, SlaClass::Medium, 3, 300).await.unwrap();

    let token = Uuid::new_v4();
    let items = queue::dequeue_batch(&pool, token, 300, 1).await.unwrap();
    let item = &items[0];

    assert!(queue::renew_lease(&pool, item.id, token, 300).await.unwrap());
    assert!(!queue::renew_lease(&pool, item.id, Uuid::new_v4(), 300).await.unwrap());

    queue::complete(&pool, item.id, token).await.unwrap();
    assert!(
        !queue::renew_lease(&pool, item.id, token, 300).await.unwrap(),
        "completed items cannot be renewed"
    );

    db.cleanup().await;
}

#[tokio::test]
async fn fail_retry_returns_item_to_pending() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let exec = seed_execution(&pool, "retry").await;
    queue::enqueue(&pool, exec, 5, SlaClass::Medium, 3, 300).await.unwrap();

    let items = queue::dequeue_batch(&pool, Uuid::new_v4(), 300, 1).await.unwrap();
    let item = &items[0];
    assert_eq!(item.attempt_count, 0);

    queue::fail_retry(&pool, item.id, "connect-failure").await.unwrap();

    let fetched = queue::get_item(&pool, item.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, QueueStatus::Pending);
    assert_eq!(fetched.attempt_count, 1);
    assert_eq!(fetched.last_error.as_deref(), Some("connect-failure"));
    assert!(fetched.lease_token.is_none(), "lease cleared for re-claim");

    // It is immediately claimable again.
    let items = queue::dequeue_batch(&pool, Uuid::new_v4(), 300, 1).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, item.id);

    db.cleanup().await;
}

#[tokio::test]
async fn exhausted_item_moves_to_dlq_and_stops_dequeuing() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let exec = seed_execution(&pool, "dlq").await;
    let item = queue::enqueue(&pool, exec, 5, SlaClass::Fast, 2, 300).await.unwrap();

    // attempt 1 fails, retried
    queue::dequeue_batch(&pool, Uuid::new_v4(), 300, 1).await.unwrap();
    queue::fail_retry(&pool, item.id, "HTTP 500").await.unwrap();

    // attempt 2 fails: attempt_count+1 == max_attempts, so dead-letter it
    queue::dequeue_batch(&pool, Uuid::new_v4(), 300, 1).await.unwrap();
    queue::fail_to_dlq(&pool, item.id, "HTTP 500").await.unwrap();

    let fetched = queue::get_item(&pool, item.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, QueueStatus::Failed);

    let dead = dlq::list_items(&pool, 10, 0, None).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_queue_id, item.id);
    assert_eq!(dead[0].execution_id, exec);
    assert!(dead[0].failure_reason.contains("500"));
    assert_eq!(dead[0].attempt_count, 2);

    // Nothing left to claim.
    let items = queue::dequeue_batch(&pool, Uuid::new_v4(), 300, 10).await.unwrap();
    assert!(items.is_empty());

    db.cleanup().await;
}

#[tokio::test]
async fn stale_lease_reaping_revives_items() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let exec = seed_execution(&pool, "stale").await;
    let item = queue::enqueue(&pool, exec, 5, SlaClass::Medium, 3, 300).await.unwrap();

    // Claim with an already-expired lease (negative duration).
    let claimed = queue::dequeue_batch(&pool, Uuid::new_v4(), -10, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let reaped = queue::reap_stale_leases(&pool).await.unwrap();
    assert_eq!(reaped, 1);

    let fetched = queue::get_item(&pool, item.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, QueueStatus::Pending);
    assert!(fetched.lease_token.is_none());

    db.cleanup().await;
}

#[tokio::test]
async fn requeue_from_dlq_resets_execution() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let exec = seed_execution(&pool, "requeue").await;
    let item = queue::enqueue(&pool, exec, 2, SlaClass::Fast, 2, 300).await.unwrap();

    queue::dequeue_batch(&pool, Uuid::new_v4(), 300, 1).await.unwrap();
    queue::fail_to_dlq(&pool, item.id, "boom").await.unwrap();
    executions::finalize_status(&pool, exec, ExecutionStatus::Failed, Some("boom"))
        .await
        .unwrap();

    let dead = dlq::list_items(&pool, 10, 0, Some(false)).await.unwrap();
    let new_queue_id = dlq::requeue(&pool, dead[0].id, 2, true)
        .await
        .unwrap()
        .expect("requeue should produce a queue row");

    let new_item = queue::get_item(&pool, new_queue_id).await.unwrap().unwrap();
    assert_eq!(new_item.status, QueueStatus::Pending);
    assert_eq!(new_item.attempt_count, 0, "attempts reset");
    assert_eq!(new_item.priority, 2, "original priority preserved");

    let refreshed = executions::get_execution(&pool, exec).await.unwrap().unwrap();
    assert_eq!(refreshed.status, ExecutionStatus::Queued);

    // Second requeue of the same DLQ row is refused.
    let again = dlq::requeue(&pool, dead[0].id, 2, true).await.unwrap();
    assert!(again.is_none());

    db.cleanup().await;
}
