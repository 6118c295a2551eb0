//! The worker pool: a supervised set of workers plus periodic maintenance.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use marshal_db::queries::queue::QueueStatusStats;

use crate::config::CoreConfig;
use crate::engine::Engine;
use crate::queue::QueueManager;
use crate::safety::cancellation::CancellationManager;
use crate::safety::mutex::AssetMutex;
use crate::safety::timeout::TimeoutEnforcer;

use super::{Worker, WorkerHealth};

/// Aggregate pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub worker_count: usize,
    pub running: bool,
    pub workers: Vec<WorkerHealth>,
    pub queue: Vec<QueueStatusStats>,
}

struct WorkerSlot {
    worker: Arc<Worker>,
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

/// Supervises N workers: starts them, restarts any that die, reaps stale
/// leases and locks, and sweeps overdue executions.
pub struct WorkerPool {
    pool: PgPool,
    queue: Arc<QueueManager>,
    engine: Arc<Engine>,
    cancellations: Arc<CancellationManager>,
    mutex: Arc<AssetMutex>,
    timeouts: Arc<TimeoutEnforcer>,
    config: Arc<CoreConfig>,
    slots: tokio::sync::Mutex<Vec<WorkerSlot>>,
    maintenance: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    root_shutdown: CancellationToken,
    spawned: std::sync::atomic::AtomicUsize,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        queue: Arc<QueueManager>,
        engine: Arc<Engine>,
        cancellations: Arc<CancellationManager>,
        mutex: Arc<AssetMutex>,
        timeouts: Arc<TimeoutEnforcer>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            pool,
            queue,
            engine,
            cancellations,
            mutex,
            timeouts,
            config,
            slots: tokio::sync::Mutex::new(Vec::new()),
            maintenance: tokio::sync::Mutex::new(None),
            root_shutdown: CancellationToken::new(),
            spawned: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Start the configured number of workers and the maintenance loop.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut slots = self.slots.lock().await;
            if !slots.is_empty() {
                warn!("worker pool already running");
                return;
            }
            let count = self.config.worker_count;
            for _ in 0..count {
                slots.push(self.spawn_worker());
            }
            info!(workers = slots.len(), "worker pool started");
        }

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move { pool.maintenance_loop().await });
        *self.maintenance.lock().await = Some(handle);
    }

    /// Stop everything: workers stop fetching, in-flight executions are
    /// cancelled with `system_shutdown`, and the pool waits out the drain
    /// timeout.
    pub async fn stop(&self) {
        info!("stopping worker pool");
        self.root_shutdown.cancel();

        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.abort();
        }

        let mut slots = self.slots.lock().await;
        let drain = Duration::from_secs(self.config.drain_timeout_seconds);
        for slot in slots.drain(..) {
            slot.shutdown.cancel();
            if tokio::time::timeout(drain, slot.task).await.is_err() {
                warn!(worker_id = %slot.worker.worker_id, "worker did not drain in time");
            }
        }
        info!("worker pool stopped");
    }

    /// Scale the pool up or down to `target` workers.
    pub async fn scale(&self, target: usize) {
        let mut slots = self.slots.lock().await;
        let current = slots.len();
        if target == current {
            return;
        }
        if target > current {
            for _ in current..target {
                slots.push(self.spawn_worker());
            }
            info!(from = current, to = target, "worker pool scaled up");
        } else {
            let drain = Duration::from_secs(self.config.drain_timeout_seconds);
            for slot in slots.drain(target..) {
                slot.shutdown.cancel();
                if tokio::time::timeout(drain, slot.task).await.is_err() {
                    warn!(worker_id = %slot.worker.worker_id, "worker did not drain in time");
                }
            }
            info!(from = current, to = target, "worker pool scaled down");
        }
    }

    /// Health of each worker plus queue statistics.
    pub async fn stats(&self) -> Result<PoolStats> {
        let slots = self.slots.lock().await;
        let workers: Vec<WorkerHealth> = slots.iter().map(|s| s.worker.health()).collect();
        let queue = self.queue.stats().await?;
        Ok(PoolStats {
            worker_count: workers.len(),
            running: !self.root_shutdown.is_cancelled(),
            workers,
            queue,
        })
    }

    fn spawn_worker(&self) -> WorkerSlot {
        let index = self
            .spawned
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let shutdown = self.root_shutdown.child_token();
        let worker = Arc::new(Worker::new(
            self.pool.clone(),
            self.queue.clone(),
            self.engine.clone(),
            self.cancellations.clone(),
            self.config.clone(),
            format!("worker-{index}"),
            shutdown.clone(),
        ));
        let task = tokio::spawn(Arc::clone(&worker).run());
        WorkerSlot {
            worker,
            task,
            shutdown,
        }
    }

    /// Periodic supervision: restart dead workers, reap stale queue leases
    /// and asset locks, sweep executions past their deadline.
    async fn maintenance_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.health_check_interval_seconds);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.root_shutdown.cancelled() => return,
            }

            // Restart workers that stopped without being asked to.
            {
                let mut slots = self.slots.lock().await;
                for slot in slots.iter_mut() {
                    let dead = slot.task.is_finished() || !slot.worker.health().running;
                    if dead && !slot.shutdown.is_cancelled() {
                        warn!(worker_id = %slot.worker.worker_id, "worker not running; restarting");
                        slot.shutdown.cancel();
                        slot.task.abort();
                        *slot = self.spawn_worker();
                    }
                }
            }

            if let Err(e) = self.queue.reap_stale_leases().await {
                error!(error = %e, "stale lease reaping failed");
            }
            if let Err(e) = self.mutex.reap_all_stale().await {
                error!(error = %e, "stale lock reaping failed");
            }
            match self.timeouts.sweep_overdue().await {
                Ok(swept) if swept > 0 => {
                    warn!(swept, "cancelled executions past their deadline");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "overdue sweep failed"),
            }
        }
    }
}
