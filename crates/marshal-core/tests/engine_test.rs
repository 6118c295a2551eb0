//! Integration tests for the execution engine: step outcomes, in-step
//! retries, queue-level retry and dead-lettering, secrets, masking, and
//! RBAC.
//!
//! Requires PostgreSQL (testcontainers, or `MARSHAL_TEST_PG_URL`).

mod harness;

use std::sync::Arc;

use serde_json::json;

use harness::{exit_outcome, linux_asset, ok_outcome, FixedHttp, RigBuilder, ScriptedShell};
use marshal_core::adapters::AdapterError;
use marshal_core::engine::FailureDisposition;
use marshal_core::safety::rbac::StaticPermissions;
use marshal_core::safety::secrets::StaticSecretStore;
use marshal_core::submit::SubmitRequest;
use marshal_db::models::{ExecutionStatus, QueueStatus, StepStatus};
use marshal_db::queries::{dlq, events, executions, queue, steps};
use marshal_test_utils::TestDb;

fn submit_request(plan: serde_json::Value) -> SubmitRequest {
    SubmitRequest {
        plan,
        approval_level: 0,
        trace_id: None,
        parent_execution_id: None,
        tags: None,
        metadata: None,
    }
}

/// Submit a plan forced onto the queued path, dequeue its item, and return
/// (execution, queue item, lease token).
async fn submit_queued(
    rig: &harness::Rig,
    plan: serde_json::Value,
) -> (marshal_db::models::Execution, marshal_core::queue::LeasedItem) {
    let execution = rig
        .submitter
        .submit(&submit_request(plan), "t1", "alice")
        .await
        .expect("submission should succeed");
    assert_eq!(execution.status, ExecutionStatus::Queued);
    let mut leased = rig
        .queue
        .dequeue("test-worker", 1)
        .await
        .expect("dequeue should succeed");
    assert_eq!(leased.len(), 1);
    (execution, leased.remove(0))
}

#[tokio::test]
async fn mixed_step_outcomes_yield_partial() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let shell = ScriptedShell::new();
    shell.push(Ok(ok_outcome("first ok")));
    shell.push(Ok(exit_outcome(1, "second broke")));

    let rig = RigBuilder::new()
        .shell(shell.clone())
        .assets(vec![linux_asset("web-1")])
        .config(|c| c.sla_fast_max_seconds = 0.0)
        .build(pool.clone());

    let plan = json!({
        "name": "mixed",
        "steps": [
            {"name": "ok", "type": "remote-shell", "target_asset_id": "web-1",
             "input": {"command": "echo ok"}},
            {"name": "broken", "type": "remote-shell", "target_asset_id": "web-1",
             "input": {"command": "false"}},
        ]
    });
    let (execution, leased) = submit_queued(&rig, plan).await;

    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Defer)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Partial);

    let rows = steps::list_steps(&pool, execution.id).await.unwrap();
    assert_eq!(rows[0].status, StepStatus::Completed);
    assert_eq!(rows[1].status, StepStatus::Failed);
    assert!(rows[1].error_message.as_deref().unwrap().contains("exit code 1"));
    assert!(rows.iter().all(|r| r.duration_ms.is_some()));

    // Partial is terminal; the queue item completes.
    rig.queue.complete(leased.item.id, leased.lease_token).await.unwrap();
    let refreshed = executions::get_execution(&pool, execution.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, ExecutionStatus::Partial);
    assert!(refreshed.completed_at.is_some());

    db.cleanup().await;
}

#[tokio::test]
async fn critical_step_failure_aborts_and_skips() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let shell = ScriptedShell::new();
    shell.push(Ok(exit_outcome(1, "critical broke")));

    let rig = RigBuilder::new()
        .shell(shell.clone())
        .assets(vec![linux_asset("web-1")])
        .config(|c| c.sla_fast_max_seconds = 0.0)
        .build(pool.clone());

    let plan = json!({
        "name": "critical",
        "steps": [
            {"name": "gate", "type": "remote-shell", "target_asset_id": "web-1",
             "critical": true, "input": {"command": "exit 1"}},
            {"name": "after", "type": "remote-shell", "target_asset_id": "web-1",
             "input": {"command": "echo never"}},
        ]
    });
    let (execution, _leased) = submit_queued(&rig, plan).await;

    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Finalize)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);

    let rows = steps::list_steps(&pool, execution.id).await.unwrap();
    assert_eq!(rows[0].status, StepStatus::Failed);
    assert_eq!(rows[1].status, StepStatus::Skipped, "remainder skipped");
    assert_eq!(shell.call_count(), 1, "skipped step never dispatched");

    db.cleanup().await;
}

#[tokio::test]
async fn in_step_retries_recover_from_transient_failures() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let shell = ScriptedShell::new();
    shell.push(Err(AdapterError::ConnectFailure("refused".into())));
    shell.push(Ok(ok_outcome("recovered")));

    let rig = RigBuilder::new()
        .shell(shell.clone())
        .assets(vec![linux_asset("web-1")])
        .config(|c| c.sla_fast_max_seconds = 0.0)
        .build(pool.clone());

    let plan = json!({
        "name": "transient",
        "steps": [{"name": "flaky", "type": "remote-shell", "target_asset_id": "web-1",
                   "max_retries": 2, "input": {"command": "echo hi"}}]
    });
    let (execution, _leased) = submit_queued(&rig, plan).await;

    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Defer)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(shell.call_count(), 2, "one retry after the connect failure");

    let rows = steps::list_steps(&pool, execution.id).await.unwrap();
    assert_eq!(rows[0].status, StepStatus::Completed);

    db.cleanup().await;
}

/// Queue-level retry: the first attempt fails entirely, the queue
/// re-dispatches, the second attempt succeeds. The item ends completed with
/// attempt_count = 1 and the step carries both a failed and a succeeded
/// event.
#[tokio::test]
async fn failed_attempt_retries_through_the_queue() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let shell = ScriptedShell::new();
    shell.push(Err(AdapterError::ConnectFailure("host down".into())));
    // Second dispatch finds the default success.

    let rig = RigBuilder::new()
        .shell(shell.clone())
        .assets(vec![linux_asset("web-1")])
        .config(|c| c.sla_fast_max_seconds = 0.0)
        .build(pool.clone());

    let plan = json!({
        "name": "queue-retry",
        "steps": [{"name": "only", "type": "remote-shell", "target_asset_id": "web-1",
                   "input": {"command": "echo hi"}}]
    });
    let (execution, leased) = submit_queued(&rig, plan).await;

    // Attempt 1: fails, deferred, queue retries.
    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Defer)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);
    let live = executions::get_execution(&pool, execution.id).await.unwrap().unwrap();
    assert_eq!(
        live.status,
        ExecutionStatus::Running,
        "deferred failure keeps the execution non-terminal"
    );
    let will_retry = rig
        .queue
        .fail(leased.item.id, "all steps failed", true)
        .await
        .unwrap();
    assert!(will_retry);

    // Attempt 2: re-dispatch succeeds.
    let mut leased = rig.queue.dequeue("test-worker", 1).await.unwrap();
    let leased = leased.remove(0);
    assert_eq!(leased.item.attempt_count, 1);
    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Defer)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);
    rig.queue.complete(leased.item.id, leased.lease_token).await.unwrap();

    let item = queue::get_item(&pool, leased.item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Completed);
    assert_eq!(item.attempt_count, 1, "one retry was consumed");

    let failed_events = events::list_events_of_type(&pool, execution.id, "step_failed")
        .await
        .unwrap();
    let succeeded_events = events::list_events_of_type(&pool, execution.id, "step_succeeded")
        .await
        .unwrap();
    assert_eq!(failed_events.len(), 1);
    assert_eq!(succeeded_events.len(), 1);

    let refreshed = executions::get_execution(&pool, execution.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, ExecutionStatus::Completed);

    db.cleanup().await;
}

/// Exhausted retries dead-letter the item and terminally fail the
/// execution; the DLQ row carries the HTTP failure reason.
#[tokio::test]
async fn persistent_failure_dead_letters() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let http = FixedHttp::new(500, "upstream exploded");

    let rig = RigBuilder::new()
        .http(http.clone())
        .config(|c| {
            c.sla_fast_max_seconds = 0.0;
            c.max_attempts_medium = 2;
        })
        .build(pool.clone());

    let plan = json!({
        "name": "always-500",
        "steps": [{"name": "call", "type": "http",
                   "input": {"url": "http://api.internal/route"}}]
    });
    let (execution, leased) = submit_queued(&rig, plan).await;

    // Attempt 1.
    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Defer)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);
    let will_retry = rig
        .queue
        .fail(leased.item.id, "http request returned status 500", true)
        .await
        .unwrap();
    assert!(will_retry);

    // Attempt 2: final.
    let leased = rig.queue.dequeue("test-worker", 1).await.unwrap().remove(0);
    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Defer)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);
    let will_retry = rig
        .queue
        .fail(leased.item.id, "http request returned status 500", true)
        .await
        .unwrap();
    assert!(!will_retry, "attempts exhausted");
    rig.engine
        .finalize_failed(&execution, "retries exhausted")
        .await
        .unwrap();

    let dead = dlq::list_items(&pool, 10, 0, None).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].execution_id, execution.id);
    assert!(dead[0].failure_reason.contains("500"));

    let refreshed = executions::get_execution(&pool, execution.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, ExecutionStatus::Failed);
    assert_eq!(http.call_count(), 2);

    // Nothing dequeues anymore.
    assert!(rig.queue.dequeue("test-worker", 10).await.unwrap().is_empty());

    db.cleanup().await;
}

#[tokio::test]
async fn secrets_resolve_at_dispatch_and_never_persist() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let shell = ScriptedShell::new();
    shell.push(Ok(ok_outcome("logged in, password=hunter2-leaked")));

    let rig = RigBuilder::new()
        .shell(shell.clone())
        .assets(vec![linux_asset("web-1")])
        .secrets(StaticSecretStore::default().with("t1", "web/root-password", "hunter2-leaked"))
        .config(|c| c.sla_fast_max_seconds = 0.0)
        .build(pool.clone());

    let plan = json!({
        "name": "secretive",
        "steps": [{"name": "login", "type": "remote-shell", "target_asset_id": "web-1",
                   "input": {
                       "command": "restart-app",
                       "username": "root",
                       "password": {"kind": "secret", "path": "web/root-password"}
                   }}]
    });
    let (execution, _leased) = submit_queued(&rig, plan).await;

    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Finalize)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    // The adapter saw the resolved value.
    let calls = rig.shell.calls();
    assert_eq!(calls[0].password.as_deref(), Some("hunter2-leaked"));

    // The snapshot still holds only the reference.
    let refreshed = executions::get_execution(&pool, execution.id).await.unwrap().unwrap();
    let snapshot = refreshed.plan_snapshot.to_string();
    assert!(!snapshot.contains("hunter2-leaked"), "snapshot must stay referential");
    assert!(snapshot.contains(r#""kind":"secret""#));

    // The step row's input is the unresolved original, and the output was
    // masked before persisting.
    let rows = steps::list_steps(&pool, execution.id).await.unwrap();
    assert!(!rows[0].input_data.to_string().contains("hunter2-leaked"));
    let output = rows[0].output_data.as_ref().unwrap().to_string();
    assert!(!output.contains("hunter2-leaked"), "stored output must be masked: {output}");

    // Access was audited, without the value.
    let audit = events::list_events_of_type(&pool, execution.id, "secret_accessed")
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(
        audit[0].details.get("secret_path").and_then(|v| v.as_str()),
        Some("web/root-password")
    );
    assert!(!audit[0].details.to_string().contains("hunter2-leaked"));

    db.cleanup().await;
}

#[tokio::test]
async fn missing_secret_fails_the_step_and_audits() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let rig = RigBuilder::new()
        .assets(vec![linux_asset("web-1")])
        .secrets(StaticSecretStore::default())
        .config(|c| c.sla_fast_max_seconds = 0.0)
        .build(pool.clone());

    let plan = json!({
        "name": "no-secret",
        "steps": [{"name": "login", "type": "remote-shell", "target_asset_id": "web-1",
                   "input": {
                       "command": "whoami",
                       "password": {"kind": "secret", "path": "missing/path"}
                   }}]
    });
    let (execution, _leased) = submit_queued(&rig, plan).await;

    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Finalize)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);

    let rows = steps::list_steps(&pool, execution.id).await.unwrap();
    assert!(rows[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("secret resolution failed"));

    let audit = events::list_events_of_type(&pool, execution.id, "secret_resolution_failed")
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);

    db.cleanup().await;
}

#[tokio::test]
async fn rbac_denial_fails_before_any_dispatch() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let shell = ScriptedShell::new();

    // alice may execute on web-1 but nothing grants db-1.
    let perms = StaticPermissions::default().grant("t1", "alice", "web-1", "execute", "*");
    let rig = RigBuilder::new()
        .shell(shell.clone())
        .assets(vec![linux_asset("web-1"), linux_asset("db-1")])
        .permissions(Arc::new(perms))
        .config(|c| c.sla_fast_max_seconds = 0.0)
        .build(pool.clone());

    let plan = json!({
        "name": "overreach",
        "steps": [
            {"name": "allowed", "type": "remote-shell", "target_asset_id": "web-1",
             "input": {"command": "uptime"}},
            {"name": "forbidden", "type": "remote-shell", "target_asset_id": "db-1",
             "input": {"command": "drop-everything"}},
        ]
    });
    let (execution, _leased) = submit_queued(&rig, plan).await;

    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Finalize)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);
    assert_eq!(shell.call_count(), 0, "no adapter call before the rbac gate");

    let refreshed = executions::get_execution(&pool, execution.id).await.unwrap().unwrap();
    assert!(refreshed.error_message.as_deref().unwrap().contains("rbac-denied"));

    let audit = events::list_events_of_type(&pool, execution.id, "rbac_denied")
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);

    db.cleanup().await;
}

#[tokio::test]
async fn missing_target_asset_fails_the_step() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let rig = RigBuilder::new()
        .config(|c| c.sla_fast_max_seconds = 0.0)
        .build(pool.clone());

    let plan = json!({
        "name": "ghost",
        "steps": [{"name": "nowhere", "type": "remote-shell", "target_asset_id": "ghost-1",
                   "input": {"command": "uptime"}}]
    });
    let (execution, _leased) = submit_queued(&rig, plan).await;

    rig.engine
        .execute(&execution, FailureDisposition::Finalize)
        .await
        .unwrap();

    let rows = steps::list_steps(&pool, execution.id).await.unwrap();
    assert_eq!(rows[0].status, StepStatus::Failed);
    assert!(rows[0].error_message.as_deref().unwrap().contains("asset not found"));

    db.cleanup().await;
}

#[tokio::test]
async fn expected_output_validation_gates_success() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let shell = ScriptedShell::new();
    shell.push(Ok(ok_outcome("service is stopped")));

    let rig = RigBuilder::new()
        .shell(shell)
        .assets(vec![linux_asset("web-1")])
        .config(|c| c.sla_fast_max_seconds = 0.0)
        .build(pool.clone());

    let plan = json!({
        "name": "check",
        "steps": [{"name": "verify", "type": "remote-shell", "target_asset_id": "web-1",
                   "input": {"command": "systemctl status app", "expected_output": "running"}}]
    });
    let (execution, _leased) = submit_queued(&rig, plan).await;

    let status = rig
        .engine
        .execute(&execution, FailureDisposition::Finalize)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed, "exit 0 but wrong output");

    let rows = steps::list_steps(&pool, execution.id).await.unwrap();
    assert!(rows[0].error_message.as_deref().unwrap().contains("does not contain"));

    db.cleanup().await;
}
