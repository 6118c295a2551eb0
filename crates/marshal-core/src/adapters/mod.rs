//! The adapter seam: narrow, side-effecting capabilities the engine consumes.
//!
//! Each trait is object-safe so concrete backends can be swapped per
//! deployment (and scripted in tests). Every call honors a hard timeout and
//! a cooperative cancellation token; an in-flight syscall is allowed to
//! finish, but its result is discarded once the token fires.
//!
//! Remote shell and PowerShell transports live outside this crate (they wrap
//! the site's automation libraries); this module ships working backends for
//! local commands, HTTP, and a static asset inventory.

pub mod assets;
pub mod http;
pub mod local;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use assets::{AssetRecord, StaticAssets};
pub use http::ReqwestHttp;
pub use local::LocalProcessRunner;

/// Transport-level adapter failures. A command that runs but exits non-zero
/// is not an adapter error; the exit code travels in [`CommandOutcome`] and
/// step validation decides what it means.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("connection failed: {0}")]
    ConnectFailure(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unsupported request: {0}")]
    Unsupported(String),
}

/// Result of running a command, local or remote.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    /// Attempts the adapter itself made (connection retries etc.).
    pub attempts: i32,
}

/// Result of an HTTP dispatch. Non-2xx statuses are carried here, not raised
/// as errors.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HttpOutcome {
    pub status: u16,
    pub body: String,
    pub headers: BTreeMap<String, String>,
    pub duration_ms: i64,
}

/// Request for a remote shell (SSH) command.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub script: String,
    pub timeout: Duration,
}

/// Request for a remote PowerShell (WinRM) script.
#[derive(Debug, Clone)]
pub struct PowershellRequest {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub script: String,
    pub timeout: Duration,
}

/// Authentication for HTTP dispatches.
#[derive(Debug, Clone)]
pub enum HttpAuth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// Request for an HTTP dispatch.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub auth: Option<HttpAuth>,
    pub verify_tls: bool,
    pub timeout: Duration,
}

/// Request for a local command.
#[derive(Debug, Clone)]
pub struct LocalRequest {
    pub command: String,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Remote shell transport (SSH).
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(
        &self,
        request: &ShellRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, AdapterError>;
}

/// Remote PowerShell transport (WinRM).
#[async_trait]
pub trait RemotePowershell: Send + Sync {
    async fn run(
        &self,
        request: &PowershellRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, AdapterError>;
}

/// HTTP client capability.
#[async_trait]
pub trait HttpDispatch: Send + Sync {
    async fn send(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpOutcome, AdapterError>;
}

/// Local command runner.
#[async_trait]
pub trait LocalRunner: Send + Sync {
    async fn run(
        &self,
        request: &LocalRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, AdapterError>;
}

/// Asset inventory queries, with optional field projection handled by the
/// caller.
#[async_trait]
pub trait AssetService: Send + Sync {
    async fn get_by_id(&self, asset_id: &str) -> Result<Option<AssetRecord>, AdapterError>;
    async fn get_by_hostname(&self, hostname: &str) -> Result<Option<AssetRecord>, AdapterError>;
    async fn list_all(&self, limit: usize) -> Result<Vec<AssetRecord>, AdapterError>;
    async fn list_by_type(
        &self,
        asset_type: &str,
        limit: usize,
    ) -> Result<Vec<AssetRecord>, AdapterError>;
    async fn count(&self) -> Result<usize, AdapterError>;
}

/// The full set of adapters the engine runs against.
#[derive(Clone)]
pub struct Adapters {
    pub remote_shell: std::sync::Arc<dyn RemoteShell>,
    pub powershell: std::sync::Arc<dyn RemotePowershell>,
    pub http: std::sync::Arc<dyn HttpDispatch>,
    pub local: std::sync::Arc<dyn LocalRunner>,
    pub assets: std::sync::Arc<dyn AssetService>,
}

/// A remote transport that always refuses. Deployments without an SSH or
/// WinRM integration wire this in; steps that need the transport fail with
/// a clear message instead of hanging.
pub struct UnconfiguredRemote;

#[async_trait]
impl RemoteShell for UnconfiguredRemote {
    async fn run(
        &self,
        request: &ShellRequest,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutcome, AdapterError> {
        Err(AdapterError::Unsupported(format!(
            "no remote shell transport configured (target {})",
            request.host
        )))
    }
}

#[async_trait]
impl RemotePowershell for UnconfiguredRemote {
    async fn run(
        &self,
        request: &PowershellRequest,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutcome, AdapterError> {
        Err(AdapterError::Unsupported(format!(
            "no remote powershell transport configured (target {})",
            request.host
        )))
    }
}
