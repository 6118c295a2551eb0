//! Step classification for persisted step rows.
//!
//! Resolution order is fixed: the declared type wins; an explicit
//! `connection_type` or a recognizable input shape is next; the target's OS
//! family is the last word before the command fallback. The same inputs
//! always classify the same way.

use crate::adapters::AssetRecord;
use crate::plan::StepKind;

/// Classify a step row for dispatch.
pub fn classify_step(
    step_type: &str,
    input: &serde_json::Value,
    asset: Option<&AssetRecord>,
) -> StepKind {
    // 1. Declared type.
    if let Some(kind) = StepKind::from_declared_strict(step_type) {
        return kind;
    }

    // 2. Explicit connection type in the input.
    if let Some(connection) = input.get("connection_type").and_then(|v| v.as_str()) {
        match connection.to_ascii_lowercase().as_str() {
            "ssh" | "linux" | "unix" => return StepKind::RemoteShell,
            "winrm" | "powershell" | "windows" => return StepKind::RemotePowershell,
            "api" | "http" | "rest" => return StepKind::Http,
            "local" => return StepKind::LocalCommand,
            _ => {}
        }
    }

    // 3. Input shape.
    if input.get("url").is_some() || input.get("endpoint").is_some() {
        return StepKind::Http;
    }
    if input.get("query_type").is_some() {
        return StepKind::AssetQuery;
    }
    if input.get("source").is_some() && input.get("destination").is_some() {
        return StepKind::FileOp;
    }

    // 4. Target OS metadata, when the step carries a command.
    let has_command = crate::plan::extract_script(input).is_some();
    if has_command {
        if let Some(os) = asset.and_then(|a| a.os_type.as_deref()) {
            let os = os.to_ascii_lowercase();
            if os.contains("windows") {
                return StepKind::RemotePowershell;
            }
            if os.contains("linux") || os.contains("unix") || os.contains("bsd") {
                return StepKind::RemoteShell;
            }
        }
    }

    // 5. Command fallback (the one place unknown types land).
    StepKind::from_declared(step_type)
}
