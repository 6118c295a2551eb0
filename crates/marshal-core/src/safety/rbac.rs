//! Worker-side authorization, as defense-in-depth against an API-layer
//! bypass.
//!
//! The whole plan is checked before any side-effectful step runs, and each
//! step is re-checked just before dispatch (plan targets can be expanded
//! late). Denials fail the execution or step with reason `rbac-denied` and
//! leave an audit event.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use marshal_db::queries::events::{self, NewEvent};

use crate::plan::{Plan, PlanStep, StepKind};

/// RBAC denial. The tuple that was refused is included for the audit trail;
/// no other detail leaves the validator.
#[derive(Debug, Error)]
#[error("rbac-denied: actor {actor_id} may not {action} on {asset} in {environment}")]
pub struct RbacDenied {
    pub actor_id: String,
    pub asset: String,
    pub action: String,
    pub environment: String,
}

/// Source of permission facts.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    async fn allows(
        &self,
        tenant_id: &str,
        actor_id: &str,
        asset: &str,
        action: &str,
        environment: &str,
    ) -> bool;
}

/// Grants everything. Only meaningful together with permissive mode in
/// development setups.
pub struct AllowAll;

#[async_trait]
impl PermissionSource for AllowAll {
    async fn allows(&self, _: &str, _: &str, _: &str, _: &str, _: &str) -> bool {
        true
    }
}

/// Fixed permission set, granted tuple by tuple. `*` matches any value in
/// that position.
#[derive(Default)]
pub struct StaticPermissions {
    grants: HashSet<(String, String, String, String, String)>,
}

impl StaticPermissions {
    pub fn grant(
        mut self,
        tenant_id: &str,
        actor_id: &str,
        asset: &str,
        action: &str,
        environment: &str,
    ) -> Self {
        self.grants.insert((
            tenant_id.to_owned(),
            actor_id.to_owned(),
            asset.to_owned(),
            action.to_owned(),
            environment.to_owned(),
        ));
        self
    }
}

#[async_trait]
impl PermissionSource for StaticPermissions {
    async fn allows(
        &self,
        tenant_id: &str,
        actor_id: &str,
        asset: &str,
        action: &str,
        environment: &str,
    ) -> bool {
        for t in [tenant_id, "*"] {
            for a in [actor_id, "*"] {
                for s in [asset, "*"] {
                    for act in [action, "*"] {
                        for e in [environment, "*"] {
                            if self.grants.contains(&(
                                t.to_owned(),
                                a.to_owned(),
                                s.to_owned(),
                                act.to_owned(),
                                e.to_owned(),
                            )) {
                                return true;
                            }
                        }
                    }
                }
            }
        }
        false
    }
}

/// The (asset, action, environment) tuple a step requires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequiredPermission {
    pub asset: String,
    pub action: String,
    pub environment: String,
}

/// Derive the permission tuple a step needs. The action comes from an
/// explicit `action` input when present, otherwise from the step kind.
pub fn required_permission(step: &PlanStep) -> RequiredPermission {
    let asset = step
        .target_asset_id
        .clone()
        .or_else(|| step.target_hostname.clone())
        .unwrap_or_else(|| "*".to_owned());

    let action = step
        .input
        .get("action")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| default_action(step.kind()).to_owned());

    let environment = step
        .input
        .get("environment")
        .and_then(|v| v.as_str())
        .unwrap_or("dev")
        .to_owned();

    RequiredPermission {
        asset,
        action,
        environment,
    }
}

fn default_action(kind: StepKind) -> &'static str {
    match kind {
        StepKind::AssetQuery | StepKind::Validation => "read",
        StepKind::Http | StepKind::FileOp => "write",
        StepKind::RemoteShell | StepKind::RemotePowershell | StepKind::LocalCommand => "execute",
    }
}

/// Worker-side RBAC validator.
pub struct RbacValidator {
    pool: PgPool,
    source: std::sync::Arc<dyn PermissionSource>,
    strict: bool,
}

impl RbacValidator {
    /// Build a validator. The active mode is logged at startup so a
    /// permissive production deployment is visible in the logs.
    pub fn new(pool: PgPool, source: std::sync::Arc<dyn PermissionSource>, strict: bool) -> Self {
        info!(
            mode = if strict { "strict" } else { "permissive" },
            "rbac validator active"
        );
        Self {
            pool,
            source,
            strict,
        }
    }

    /// Check every distinct permission tuple in the plan before the first
    /// step runs.
    pub async fn validate_plan(
        &self,
        plan: &Plan,
        execution_id: Uuid,
        tenant_id: &str,
        actor_id: &str,
    ) -> Result<(), RbacDenied> {
        let mut seen = HashSet::new();
        for step in &plan.steps {
            let required = required_permission(step);
            if seen.insert(required.clone()) {
                self.check(&required, execution_id, tenant_id, actor_id)
                    .await?;
            }
        }
        debug!(execution_id = %execution_id, tuples = seen.len(), "plan rbac check passed");
        Ok(())
    }

    /// Re-check a single step immediately before dispatch.
    pub async fn validate_step(
        &self,
        step: &PlanStep,
        execution_id: Uuid,
        tenant_id: &str,
        actor_id: &str,
    ) -> Result<(), RbacDenied> {
        let required = required_permission(step);
        self.check(&required, execution_id, tenant_id, actor_id).await
    }

    async fn check(
        &self,
        required: &RequiredPermission,
        execution_id: Uuid,
        tenant_id: &str,
        actor_id: &str,
    ) -> Result<(), RbacDenied> {
        if !self.strict {
            // Permissive mode allows by default; intended for development
            // only. The startup log line records that it is active.
            return Ok(());
        }

        let allowed = self
            .source
            .allows(
                tenant_id,
                actor_id,
                &required.asset,
                &required.action,
                &required.environment,
            )
            .await;

        if allowed {
            return Ok(());
        }

        let denied = RbacDenied {
            actor_id: actor_id.to_owned(),
            asset: required.asset.clone(),
            action: required.action.clone(),
            environment: required.environment.clone(),
        };
        error!(execution_id = %execution_id, %denied, "rbac validation failed");

        let event = NewEvent::of(
            execution_id,
            "rbac_denied",
            serde_json::json!({
                "actor_id": actor_id,
                "asset": required.asset,
                "action": required.action,
                "environment": required.environment,
            }),
        );
        if let Err(e) = events::insert_event(&self.pool, &event).await {
            error!(execution_id = %execution_id, error = %e, "failed to persist rbac audit event");
        }

        Err(denied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(value: serde_json::Value) -> PlanStep {
        serde_json::from_value(value).expect("test step should parse")
    }

    #[test]
    fn action_defaults_follow_step_kind() {
        let query = step(json!({"type": "asset-query", "input": {}}));
        assert_eq!(required_permission(&query).action, "read");

        let shell = step(json!({
            "type": "remote-shell",
            "target_asset_id": "web-1",
            "input": {"command": "uptime"}
        }));
        let required = required_permission(&shell);
        assert_eq!(required.action, "execute");
        assert_eq!(required.asset, "web-1");
        assert_eq!(required.environment, "dev");
    }

    #[test]
    fn explicit_action_and_environment_win() {
        let s = step(json!({
            "type": "remote-shell",
            "target_asset_id": "db-1",
            "input": {"command": "pg_dump", "action": "backup", "environment": "prod"}
        }));
        let required = required_permission(&s);
        assert_eq!(required.action, "backup");
        assert_eq!(required.environment, "prod");
    }

    #[tokio::test]
    async fn static_permissions_match_wildcards() {
        let perms = StaticPermissions::default()
            .grant("t1", "alice", "*", "execute", "*")
            .grant("t1", "*", "db-1", "read", "prod");

        assert!(perms.allows("t1", "alice", "web-9", "execute", "dev").await);
        assert!(perms.allows("t1", "bob", "db-1", "read", "prod").await);
        assert!(!perms.allows("t1", "bob", "db-1", "write", "prod").await);
        assert!(!perms.allows("t2", "alice", "web-9", "execute", "dev").await);
    }
}
