//! Dead-letter queue maintenance commands.

use anyhow::Result;
use uuid::Uuid;

use crate::wiring::Runtime;

pub async fn list(runtime: &Runtime, limit: i64, requeued: Option<bool>) -> Result<()> {
    let items = runtime.dlq.list(limit, 0, requeued).await?;
    if items.is_empty() {
        println!("dead-letter queue is empty");
        return Ok(());
    }
    for item in items {
        println!(
            "{}  execution={}  attempts={}  requeued={}  {}",
            item.failed_at.format("%Y-%m-%d %H:%M:%S"),
            item.execution_id,
            item.attempt_count,
            item.requeued,
            item.failure_reason,
        );
    }
    Ok(())
}

pub async fn requeue(runtime: &Runtime, dlq_id: Uuid, reset_attempts: bool) -> Result<()> {
    match runtime.dlq.requeue(dlq_id, reset_attempts).await? {
        Some(queue_id) => println!("requeued as queue item {queue_id}"),
        None => println!("item {dlq_id} not requeued (missing or already requeued)"),
    }
    Ok(())
}

pub async fn archive(runtime: &Runtime) -> Result<()> {
    let archived = runtime.dlq.archive_old().await?;
    println!("archived {archived} items");
    Ok(())
}

pub async fn stats(runtime: &Runtime) -> Result<()> {
    let stats = runtime.dlq.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let reasons = runtime.dlq.failure_reasons(10).await?;
    if !reasons.is_empty() {
        println!("top failure reasons:");
        for (reason, count) in reasons {
            println!("  {count:>5}  {reason}");
        }
    }
    Ok(())
}
