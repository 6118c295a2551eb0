//! The plan model: what a client submits for execution.
//!
//! A plan is a named, ordered list of steps. Each step carries a declared
//! type, an optional target reference (asset ID or hostname), and a free-form
//! JSON input payload that may embed secret references. The snapshot stored
//! on the execution row is the canonical serialization of this structure and
//! never contains resolved secret material.

pub mod canonical;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Step classification. Declared types that match none of the variants fall
/// back to [`StepKind::LocalCommand`]; that fallback lives in
/// [`StepKind::from_declared`] and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    RemoteShell,
    RemotePowershell,
    Http,
    AssetQuery,
    LocalCommand,
    Validation,
    FileOp,
}

impl StepKind {
    /// Resolve a declared type string, accepting the aliases clients use.
    /// Returns `None` for unknown strings; callers that want the implicit
    /// command fallback use [`Self::from_declared`].
    pub fn from_declared_strict(declared: &str) -> Option<Self> {
        match declared.to_ascii_lowercase().as_str() {
            "remote-shell" | "ssh" | "shell" | "bash" => Some(Self::RemoteShell),
            "remote-powershell" | "powershell" | "winrm" => Some(Self::RemotePowershell),
            "http" | "api" | "rest" => Some(Self::Http),
            "asset-query" | "asset-service-query" | "asset-list" | "list-assets" => {
                Some(Self::AssetQuery)
            }
            "local-command" | "command" | "local" | "script" => Some(Self::LocalCommand),
            "validation" | "check" | "verify" => Some(Self::Validation),
            "file-op" | "file" | "copy" | "transfer" => Some(Self::FileOp),
            _ => None,
        }
    }

    /// Resolve a declared type string, treating unknown types as a local
    /// command. This is the single place the fallback is applied.
    pub fn from_declared(declared: &str) -> Self {
        Self::from_declared_strict(declared).unwrap_or(Self::LocalCommand)
    }

    /// Canonical wire name for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoteShell => "remote-shell",
            Self::RemotePowershell => "remote-powershell",
            Self::Http => "http",
            Self::AssetQuery => "asset-query",
            Self::LocalCommand => "local-command",
            Self::Validation => "validation",
            Self::FileOp => "file-op",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a plan as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Human-readable step name. Defaults from the index when omitted.
    #[serde(default)]
    pub name: Option<String>,
    /// Declared type string; resolved through [`StepKind::from_declared`].
    #[serde(rename = "type", alias = "step_type", alias = "tool")]
    pub step_type: String,
    #[serde(default)]
    pub target_asset_id: Option<String>,
    #[serde(default)]
    pub target_hostname: Option<String>,
    /// Free-form input payload; may contain secret references.
    #[serde(default = "empty_object", alias = "inputs", alias = "input_data")]
    pub input: serde_json::Value,
    /// A failed critical step aborts the rest of the plan.
    #[serde(default)]
    pub critical: bool,
    /// In-process retry bound for this step's adapter call.
    #[serde(default)]
    pub max_retries: i32,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl PlanStep {
    /// The resolved step kind (with the command fallback applied).
    pub fn kind(&self) -> StepKind {
        StepKind::from_declared(&self.step_type)
    }

    /// Display name for this step at a given index.
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("step-{}", index + 1))
    }

    fn has_target(&self) -> bool {
        self.target_asset_id.is_some() || self.target_hostname.is_some()
    }
}

/// An ordered list of steps submitted as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    /// When true, step order does not matter and canonicalization sorts
    /// steps before hashing, so reordered submissions deduplicate.
    #[serde(default)]
    pub order_independent: bool,
    pub steps: Vec<PlanStep>,
}

/// Rejections produced at submission time. No execution record exists for a
/// plan that fails validation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan could not be parsed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("plan has no steps")]
    NoSteps,
    #[error("step {index} ({name}): {reason}")]
    InvalidStep {
        index: usize,
        name: String,
        reason: String,
    },
}

impl Plan {
    /// Parse and validate a plan from raw JSON.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, PlanError> {
        let plan: Plan = serde_json::from_value(value.clone())?;
        plan.validate()?;
        Ok(plan)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::NoSteps);
        }

        for (index, step) in self.steps.iter().enumerate() {
            let name = step.display_name(index);
            let invalid = |reason: &str| PlanError::InvalidStep {
                index,
                name: name.clone(),
                reason: reason.to_owned(),
            };

            match step.kind() {
                StepKind::RemoteShell | StepKind::RemotePowershell => {
                    if !step.has_target() {
                        return Err(invalid("remote step needs a target asset or hostname"));
                    }
                    if extract_script(&step.input).is_none() {
                        return Err(invalid("remote step needs a command or script input"));
                    }
                }
                StepKind::Http => {
                    let has_url = step.input.get("url").is_some()
                        || step.input.get("endpoint").is_some()
                        || step.input.get("host").is_some();
                    if !has_url {
                        return Err(invalid("http step needs a url, endpoint, or host input"));
                    }
                }
                StepKind::LocalCommand => {
                    if extract_script(&step.input).is_none() {
                        return Err(invalid("command step needs a command input"));
                    }
                }
                StepKind::FileOp => {
                    if step.input.get("source").is_none()
                        || step.input.get("destination").is_none()
                    {
                        return Err(invalid("file step needs source and destination inputs"));
                    }
                }
                StepKind::AssetQuery | StepKind::Validation => {}
            }

            if step.max_retries < 0 {
                return Err(invalid("max_retries must be non-negative"));
            }
        }

        Ok(())
    }

    /// Distinct asset IDs the plan targets, in plan order.
    pub fn target_asset_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        for step in &self.steps {
            if let Some(id) = &step.target_asset_id {
                if !out.contains(id) {
                    out.push(id.clone());
                }
            }
        }
        out
    }
}

/// Pull the command or script string out of a step input, wherever the
/// client put it.
pub fn extract_script(input: &serde_json::Value) -> Option<&str> {
    input
        .get("command")
        .or_else(|| input.get("script"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell_step(target: &str) -> serde_json::Value {
        json!({
            "name": "restart",
            "type": "remote-shell",
            "target_asset_id": target,
            "input": {"command": "systemctl restart nginx"}
        })
    }

    #[test]
    fn parses_a_minimal_plan() {
        let plan = Plan::from_value(&json!({
            "name": "restart-web",
            "steps": [shell_step("web-1")]
        }))
        .expect("plan should parse");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].kind(), StepKind::RemoteShell);
        assert!(!plan.steps[0].critical);
    }

    #[test]
    fn unknown_type_falls_back_to_local_command() {
        assert_eq!(StepKind::from_declared("journalctl"), StepKind::LocalCommand);
        assert_eq!(StepKind::from_declared_strict("journalctl"), None);
        assert_eq!(StepKind::from_declared("SSH"), StepKind::RemoteShell);
        assert_eq!(StepKind::from_declared("winrm"), StepKind::RemotePowershell);
    }

    #[test]
    fn empty_plan_rejected() {
        let err = Plan::from_value(&json!({"name": "noop", "steps": []})).unwrap_err();
        assert!(matches!(err, PlanError::NoSteps));
    }

    #[test]
    fn remote_step_without_target_rejected() {
        let err = Plan::from_value(&json!({
            "name": "bad",
            "steps": [{
                "type": "remote-shell",
                "input": {"command": "uptime"}
            }]
        }))
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("target"), "unexpected message: {msg}");
    }

    #[test]
    fn http_step_requires_url_shape() {
        let err = Plan::from_value(&json!({
            "name": "bad-http",
            "steps": [{"type": "http", "input": {}}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("url"));

        Plan::from_value(&json!({
            "name": "ok-http",
            "steps": [{"type": "http", "input": {"host": "10.0.0.5", "path": "/status"}}]
        }))
        .expect("host-based http step should validate");
    }

    #[test]
    fn target_asset_ids_deduplicate_in_order() {
        let plan = Plan::from_value(&json!({
            "name": "multi",
            "steps": [shell_step("b"), shell_step("a"), shell_step("b")]
        }))
        .unwrap();
        assert_eq!(plan.target_asset_ids(), vec!["b".to_string(), "a".to_string()]);
    }
}
