//! Local command execution via `tokio::process`.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AdapterError, CommandOutcome, LocalRequest, LocalRunner};

/// Runs commands on the worker host through `sh -c`.
///
/// The child is killed when the timeout or the cancellation token fires;
/// `kill_on_drop` covers the task-abort path.
pub struct LocalProcessRunner;

#[async_trait]
impl LocalRunner for LocalProcessRunner {
    async fn run(
        &self,
        request: &LocalRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, AdapterError> {
        let started = Instant::now();

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }

        debug!(command = %request.command, "spawning local command");

        let child = command
            .spawn()
            .map_err(|e| AdapterError::ConnectFailure(format!("failed to spawn: {e}")))?;

        let output = tokio::select! {
            result = tokio::time::timeout(request.timeout, child.wait_with_output()) => {
                match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => {
                        return Err(AdapterError::Transport(format!("wait failed: {e}")));
                    }
                    Err(_) => return Err(AdapterError::Timeout(request.timeout)),
                }
            }
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
        };

        Ok(CommandOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: started.elapsed().as_millis() as i64,
            attempts: 1,
        })
    }
}
