//! Component graph construction.
//!
//! Everything is built once here at process start and passed down
//! explicitly; there are no global singletons.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;

use marshal_core::adapters::{
    Adapters, AssetRecord, LocalProcessRunner, ReqwestHttp, StaticAssets, UnconfiguredRemote,
};
use marshal_core::config::CoreConfig;
use marshal_core::engine::{Engine, EngineDeps};
use marshal_core::monitor::{EventBus, MetricsRegistry};
use marshal_core::queue::dlq::DlqHandler;
use marshal_core::queue::QueueManager;
use marshal_core::safety::cancellation::CancellationManager;
use marshal_core::safety::masking::LogMasker;
use marshal_core::safety::mutex::{AssetMutex, MutexConfig};
use marshal_core::safety::rbac::{AllowAll, RbacValidator};
use marshal_core::safety::secrets::{EnvSecretStore, SecretResolver};
use marshal_core::safety::timeout::TimeoutEnforcer;
use marshal_core::submit::Submitter;
use marshal_core::worker::pool::WorkerPool;

/// The wired process: shared by `serve` and `work`.
pub struct Runtime {
    pub pool: PgPool,
    pub config: Arc<CoreConfig>,
    pub submitter: Arc<Submitter>,
    pub worker_pool: Arc<WorkerPool>,
    pub queue: Arc<QueueManager>,
    pub dlq: Arc<DlqHandler>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Load the asset inventory from a JSON file (an array of records).
pub fn load_assets(path: Option<&Path>) -> Result<Vec<AssetRecord>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read assets file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse assets file {}", path.display()))
}

/// Build the full component graph over an existing pool.
pub fn build_runtime(
    pool: PgPool,
    config: CoreConfig,
    assets: Vec<AssetRecord>,
    masker: Arc<LogMasker>,
) -> Result<Runtime> {
    let config = Arc::new(config);
    let bus = Arc::new(EventBus::default());
    let metrics = Arc::new(MetricsRegistry::new());

    let cancellations = Arc::new(CancellationManager::new(
        pool.clone(),
        Duration::from_secs(config.cleanup_timeout_seconds),
    ));

    let mutex = Arc::new(AssetMutex::new(
        pool.clone(),
        MutexConfig {
            lease_duration_seconds: config.lock_lease_duration_seconds,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
            stale_threshold_seconds: config.stale_lock_threshold_seconds,
            retry_interval: Duration::from_secs(1),
        },
        format!("marshal-{}", std::process::id()),
    ));

    let timeouts = Arc::new(TimeoutEnforcer::new(
        pool.clone(),
        cancellations.clone(),
        config.execution_timeout_buffer,
    ));

    let secrets = Arc::new(SecretResolver::new(pool.clone(), Arc::new(EnvSecretStore)));

    // Deployments plug their permission service in here; the stock binary
    // grants all tuples, so strict mode only bites once a real source is
    // wired.
    let rbac = Arc::new(RbacValidator::new(
        pool.clone(),
        Arc::new(AllowAll),
        config.rbac_strict,
    ));

    let remote = Arc::new(UnconfiguredRemote);
    let adapters = Adapters {
        remote_shell: remote.clone(),
        powershell: remote,
        http: Arc::new(ReqwestHttp::new().map_err(|e| anyhow::anyhow!("{e}"))?),
        local: Arc::new(LocalProcessRunner),
        assets: Arc::new(StaticAssets::new(assets)),
    };

    let engine = Arc::new(Engine::new(EngineDeps {
        pool: pool.clone(),
        config: config.clone(),
        adapters,
        mutex: mutex.clone(),
        secrets,
        rbac,
        cancellations: cancellations.clone(),
        timeouts: timeouts.clone(),
        bus: bus.clone(),
        metrics: metrics.clone(),
        masker,
    }));

    let queue = Arc::new(QueueManager::new(pool.clone(), config.clone()));
    let dlq = Arc::new(DlqHandler::new(pool.clone(), config.clone()));

    let submitter = Arc::new(Submitter::new(
        pool.clone(),
        config.clone(),
        engine.clone(),
        queue.clone(),
        cancellations.clone(),
        timeouts.clone(),
        bus.clone(),
    ));

    let worker_pool = Arc::new(WorkerPool::new(
        pool.clone(),
        queue.clone(),
        engine,
        cancellations,
        mutex,
        timeouts,
        config.clone(),
    ));

    Ok(Runtime {
        pool,
        config,
        submitter,
        worker_pool,
        queue,
        dlq,
        bus,
        metrics,
    })
}
