//! Background workers: long-lived consumers of the execution queue.

pub mod pool;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use marshal_db::models::{Execution, ExecutionStatus};
use marshal_db::queries::executions;

use crate::config::CoreConfig;
use crate::engine::{Engine, FailureDisposition};
use crate::queue::{LeasedItem, QueueManager};
use crate::safety::cancellation::{CancelReason, CancellationManager};

/// Health snapshot reported by a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub running: bool,
    pub in_flight: usize,
}

/// One queue consumer. Each worker processes one execution at a time:
/// dequeue with a lease, keep the lease renewed in the background, hand the
/// execution to the engine, and settle the queue item from the result.
pub struct Worker {
    pool: PgPool,
    queue: Arc<QueueManager>,
    engine: Arc<Engine>,
    cancellations: Arc<CancellationManager>,
    config: Arc<CoreConfig>,
    pub worker_id: String,
    shutdown: CancellationToken,
    running: AtomicBool,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        queue: Arc<QueueManager>,
        engine: Arc<Engine>,
        cancellations: Arc<CancellationManager>,
        config: Arc<CoreConfig>,
        worker_id: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            queue,
            engine,
            cancellations,
            config,
            worker_id: worker_id.into(),
            shutdown,
            running: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Main loop: poll, process, repeat until shutdown.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, "worker started");

        // Cancel in-flight work the moment shutdown fires, so a long step
        // aborts at its next suspension point instead of holding the drain.
        let drain_on_shutdown = {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.shutdown.cancelled().await;
                this.drain().await;
            })
        };

        while !self.shutdown.is_cancelled() {
            let items = match self.queue.dequeue(&self.worker_id, self.config.batch_size).await {
                Ok(items) => items,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "dequeue failed");
                    self.idle_sleep().await;
                    continue;
                }
            };

            if items.is_empty() {
                self.idle_sleep().await;
                continue;
            }

            for item in items {
                if self.shutdown.is_cancelled() {
                    // Give up the claim; the lease expires and another
                    // worker picks the item up.
                    break;
                }
                self.process_item(item).await;
            }
        }

        let _ = drain_on_shutdown.await;
        // Second pass for anything that landed in flight after the first.
        self.drain().await;
        self.running.store(false, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn idle_sleep(&self) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_seconds)) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Process one leased item end to end.
    async fn process_item(&self, leased: LeasedItem) {
        let execution_id = leased.item.execution_id;
        let queue_id = leased.item.id;

        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .insert(execution_id);

        info!(
            worker_id = %self.worker_id,
            execution_id = %execution_id,
            queue_id = %queue_id,
            attempt = leased.item.attempt_count + 1,
            max_attempts = leased.item.max_attempts,
            "processing execution"
        );

        let renewer = self.spawn_lease_renewer(&leased);
        let outcome = self.run_execution(execution_id).await;
        renewer.abort();

        match outcome {
            // Completed and partial attempts settle the item.
            Ok((_, status)) if status != ExecutionStatus::Failed => {
                if let Err(e) = self.queue.complete(queue_id, leased.lease_token).await {
                    // Lease lost mid-run: the item may be re-dispatched, but
                    // the engine's terminal check makes the re-run a no-op.
                    error!(
                        worker_id = %self.worker_id,
                        queue_id = %queue_id,
                        error = %e,
                        "failed to complete queue item"
                    );
                } else {
                    info!(
                        worker_id = %self.worker_id,
                        execution_id = %execution_id,
                        status = %status,
                        "execution settled"
                    );
                }
            }
            // A failed attempt goes back to the queue; only exhaustion
            // terminates the execution.
            Ok((execution, _)) => {
                self.settle_failure(&execution, queue_id, "all steps failed")
                    .await;
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(
                    worker_id = %self.worker_id,
                    execution_id = %execution_id,
                    error = %message,
                    "execution attempt errored"
                );
                match executions::get_execution(&self.pool, execution_id).await {
                    Ok(Some(execution)) => {
                        self.settle_failure(&execution, queue_id, &message).await;
                    }
                    Ok(None) => {
                        let _ = self.queue.fail(queue_id, &message, false).await;
                    }
                    Err(e) => {
                        error!(queue_id = %queue_id, error = %e, "failed to reload execution");
                    }
                }
            }
        }

        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .remove(&execution_id);
    }

    /// Report a failed attempt to the queue; on exhausted retries the item
    /// dead-letters and the execution is terminally failed.
    async fn settle_failure(&self, execution: &Execution, queue_id: Uuid, message: &str) {
        match self.queue.fail(queue_id, message, true).await {
            Ok(true) => {
                info!(
                    worker_id = %self.worker_id,
                    execution_id = %execution.id,
                    "attempt failed; queue will retry"
                );
            }
            Ok(false) => {
                if let Err(e) = self.engine.finalize_failed(execution, message).await {
                    error!(execution_id = %execution.id, error = %e, "failed to finalize execution");
                }
            }
            Err(e) => {
                error!(queue_id = %queue_id, error = %e, "failed to settle queue item");
            }
        }
    }

    /// Load the execution and run the engine with deferred failure: the
    /// queue decides whether a failed attempt retries.
    async fn run_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<(Execution, ExecutionStatus)> {
        let execution = executions::get_execution(&self.pool, execution_id)
            .await?
            .with_context(|| format!("execution {execution_id} not found"))?;
        let status = self
            .engine
            .execute(&execution, FailureDisposition::Defer)
            .await?;
        Ok((execution, status))
    }

    /// Keep the queue lease alive while the engine runs. A refused renewal
    /// means ownership is gone: cancel the execution (reason `error`) since
    /// another worker may already be re-running it.
    fn spawn_lease_renewer(&self, leased: &LeasedItem) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let cancellations = self.cancellations.clone();
        let interval = Duration::from_secs(self.config.lease_renewal_interval_seconds);
        let queue_id = leased.item.id;
        let lease_token = leased.lease_token;
        let execution_id = leased.item.execution_id;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match queue.renew_lease(queue_id, lease_token).await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            queue_id = %queue_id,
                            execution_id = %execution_id,
                            "lease renewal refused; cancelling execution"
                        );
                        if let Err(e) = cancellations
                            .cancel_execution(
                                execution_id,
                                CancelReason::Error,
                                Some("lease renewal failed"),
                                None,
                            )
                            .await
                        {
                            error!(execution_id = %execution_id, error = %e, "cancellation failed");
                        }
                        break;
                    }
                    Err(e) => {
                        // Transient persistence trouble; keep trying until
                        // the lease actually lapses.
                        warn!(queue_id = %queue_id, error = %e, "lease renewal errored");
                    }
                }
            }
        })
    }

    /// Graceful shutdown: cancel anything still in flight.
    async fn drain(&self) {
        let in_flight: Vec<Uuid> = self
            .in_flight
            .lock()
            .expect("in-flight set poisoned")
            .iter()
            .copied()
            .collect();

        for execution_id in in_flight {
            warn!(
                worker_id = %self.worker_id,
                execution_id = %execution_id,
                "cancelling in-flight execution for shutdown"
            );
            if let Err(e) = self
                .cancellations
                .cancel_execution(
                    execution_id,
                    CancelReason::SystemShutdown,
                    Some("worker shutdown"),
                    None,
                )
                .await
            {
                error!(execution_id = %execution_id, error = %e, "shutdown cancellation failed");
            }
        }
    }

    pub fn health(&self) -> WorkerHealth {
        WorkerHealth {
            worker_id: self.worker_id.clone(),
            running: self.running.load(Ordering::SeqCst),
            in_flight: self.in_flight.lock().expect("in-flight set poisoned").len(),
        }
    }
}
