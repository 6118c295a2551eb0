//! Shared rig for marshal-core integration tests: a fully wired engine and
//! submitter over a temp database, with scriptable adapters.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use marshal_core::adapters::{
    AdapterError, Adapters, AssetRecord, AssetService, CommandOutcome, HttpDispatch, HttpOutcome,
    HttpRequest, LocalProcessRunner, PowershellRequest, RemotePowershell, RemoteShell,
    ShellRequest, StaticAssets,
};
use marshal_core::config::CoreConfig;
use marshal_core::engine::{Engine, EngineDeps};
use marshal_core::monitor::{EventBus, MetricsRegistry};
use marshal_core::queue::dlq::DlqHandler;
use marshal_core::queue::QueueManager;
use marshal_core::safety::cancellation::CancellationManager;
use marshal_core::safety::masking::LogMasker;
use marshal_core::safety::mutex::{AssetMutex, MutexConfig};
use marshal_core::safety::rbac::{AllowAll, PermissionSource, RbacValidator};
use marshal_core::safety::secrets::{SecretResolver, SecretStore, StaticSecretStore};
use marshal_core::safety::timeout::TimeoutEnforcer;
use marshal_core::submit::Submitter;

/// One observed adapter call: which host, and when it ran.
#[derive(Debug, Clone)]
pub struct ShellCall {
    pub host: String,
    pub script: String,
    pub password: Option<String>,
    pub started: Instant,
    pub finished: Instant,
}

/// Scriptable remote shell: pops queued responses, then falls back to a
/// default success. Records every call for interleaving assertions.
pub struct ScriptedShell {
    responses: Mutex<VecDeque<Result<CommandOutcome, AdapterError>>>,
    pub calls: Mutex<Vec<ShellCall>>,
    pub delay: Duration,
    pub default_stdout: String,
}

impl ScriptedShell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            default_stdout: "ok".to_owned(),
        })
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay,
            default_stdout: "ok".to_owned(),
        })
    }

    /// Queue the next response.
    pub fn push(&self, response: Result<CommandOutcome, AdapterError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<ShellCall> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn ok_outcome(stdout: &str) -> CommandOutcome {
    CommandOutcome {
        exit_code: 0,
        stdout: stdout.to_owned(),
        stderr: String::new(),
        duration_ms: 1,
        attempts: 1,
    }
}

pub fn exit_outcome(exit_code: i32, stderr: &str) -> CommandOutcome {
    CommandOutcome {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_owned(),
        duration_ms: 1,
        attempts: 1,
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn run(
        &self,
        request: &ShellRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, AdapterError> {
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            }
        }
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ok_outcome(&self.default_stdout)));
        self.calls.lock().unwrap().push(ShellCall {
            host: request.host.clone(),
            script: request.script.clone(),
            password: request.password.clone(),
            started,
            finished: Instant::now(),
        });
        response
    }
}

#[async_trait]
impl RemotePowershell for ScriptedShell {
    async fn run(
        &self,
        request: &PowershellRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, AdapterError> {
        let shell_request = ShellRequest {
            host: request.host.clone(),
            port: request.port,
            username: request.username.clone(),
            password: Some(request.password.clone()),
            private_key: None,
            script: request.script.clone(),
            timeout: request.timeout,
        };
        RemoteShell::run(self, &shell_request, cancel).await
    }
}

/// HTTP stub that always answers with a fixed status and body.
pub struct FixedHttp {
    pub status: u16,
    pub body: String,
    pub calls: Mutex<usize>,
}

impl FixedHttp {
    pub fn new(status: u16, body: &str) -> Arc<Self> {
        Arc::new(Self {
            status,
            body: body.to_owned(),
            calls: Mutex::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl HttpDispatch for FixedHttp {
    async fn send(
        &self,
        _request: &HttpRequest,
        _cancel: &CancellationToken,
    ) -> Result<HttpOutcome, AdapterError> {
        *self.calls.lock().unwrap() += 1;
        Ok(HttpOutcome {
            status: self.status,
            body: self.body.clone(),
            headers: BTreeMap::new(),
            duration_ms: 1,
        })
    }
}

pub fn linux_asset(id: &str) -> AssetRecord {
    AssetRecord {
        id: id.to_owned(),
        hostname: format!("{id}.internal"),
        ip_address: None,
        os_type: Some("linux".to_owned()),
        asset_type: Some("server".to_owned()),
        environment: Some("dev".to_owned()),
        metadata: serde_json::json!({}),
    }
}

/// Builder for the wired test rig.
pub struct RigBuilder {
    config: CoreConfig,
    shell: Option<Arc<ScriptedShell>>,
    http: Option<Arc<dyn HttpDispatch>>,
    assets: Vec<AssetRecord>,
    secrets: Option<Arc<dyn SecretStore>>,
    permissions: Option<Arc<dyn PermissionSource>>,
}

impl RigBuilder {
    pub fn new() -> Self {
        let mut config = CoreConfig::default();
        // Tests should fail fast, not sit out production backoffs.
        config.lock_wait_seconds = 5;
        config.poll_interval_seconds = 1;
        Self {
            config,
            shell: None,
            http: None,
            assets: Vec::new(),
            secrets: None,
            permissions: None,
        }
    }

    pub fn config(mut self, mutate: impl FnOnce(&mut CoreConfig)) -> Self {
        mutate(&mut self.config);
        self
    }

    pub fn shell(mut self, shell: Arc<ScriptedShell>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn http(mut self, http: Arc<dyn HttpDispatch>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn assets(mut self, assets: Vec<AssetRecord>) -> Self {
        self.assets = assets;
        self
    }

    pub fn secrets(mut self, store: StaticSecretStore) -> Self {
        self.secrets = Some(Arc::new(store));
        self
    }

    pub fn permissions(mut self, source: Arc<dyn PermissionSource>) -> Self {
        self.permissions = Some(source);
        self
    }

    pub fn build(self, pool: PgPool) -> Rig {
        let config = Arc::new(self.config);
        let bus = Arc::new(EventBus::default());
        let metrics = Arc::new(MetricsRegistry::new());
        let masker = Arc::new(LogMasker::with_defaults(true));

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
                retry_interval: Duration::from_millis(50),
            },
            "test-rig",
        ));

        let timeouts = Arc::new(TimeoutEnforcer::new(
            pool.clone(),
            cancellations.clone(),
            config.execution_timeout_buffer,
        ));

        let secrets = Arc::new(SecretResolver::new(
            pool.clone(),
            self.secrets
                .unwrap_or_else(|| Arc::new(StaticSecretStore::default())),
        ));

        let strict = self.permissions.is_some() || config.rbac_strict;
        let rbac = Arc::new(RbacValidator::new(
            pool.clone(),
            self.permissions.unwrap_or_else(|| Arc::new(AllowAll)),
            strict,
        ));

        let shell = self.shell.unwrap_or_else(ScriptedShell::new);
        let adapters = Adapters {
            remote_shell: shell.clone(),
            powershell: shell.clone(),
            http: self.http.unwrap_or_else(|| FixedHttp::new(200, "ok")),
            local: Arc::new(LocalProcessRunner),
            assets: Arc::new(StaticAssets::new(self.assets)),
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

        Rig {
            pool,
            config,
            engine,
            submitter,
            queue,
            dlq,
            cancellations,
            timeouts,
            mutex,
            bus,
            metrics,
            shell,
        }
    }
}

/// The wired rig handed to tests.
pub struct Rig {
    pub pool: PgPool,
    pub config: Arc<CoreConfig>,
    pub engine: Arc<Engine>,
    pub submitter: Arc<Submitter>,
    pub queue: Arc<QueueManager>,
    pub dlq: Arc<DlqHandler>,
    pub cancellations: Arc<CancellationManager>,
    pub timeouts: Arc<TimeoutEnforcer>,
    pub mutex: Arc<AssetMutex>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<MetricsRegistry>,
    pub shell: Arc<ScriptedShell>,
}

/// Asset service that always errors; for upstream-failure tests.
pub struct BrokenAssets;

#[async_trait]
impl AssetService for BrokenAssets {
    async fn get_by_id(&self, _: &str) -> Result<Option<AssetRecord>, AdapterError> {
        Err(AdapterError::Transport("inventory unavailable".into()))
    }
    async fn get_by_hostname(&self, _: &str) -> Result<Option<AssetRecord>, AdapterError> {
        Err(AdapterError::Transport("inventory unavailable".into()))
    }
    async fn list_all(&self, _: usize) -> Result<Vec<AssetRecord>, AdapterError> {
        Err(AdapterError::Transport("inventory unavailable".into()))
    }
    async fn list_by_type(&self, _: &str, _: usize) -> Result<Vec<AssetRecord>, AdapterError> {
        Err(AdapterError::Transport("inventory unavailable".into()))
    }
    async fn count(&self) -> Result<usize, AdapterError> {
        Err(AdapterError::Transport("inventory unavailable".into()))
    }
}
