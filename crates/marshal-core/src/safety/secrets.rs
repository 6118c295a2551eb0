//! Just-in-time secret resolution.
//!
//! Plans carry secret references -- `{"kind": "secret", "path": "db/prod/password"}`
//! -- never values. References are resolved at step execution time against a
//! [`SecretStore`], each access is audited, and resolved material is never
//! written back to any persisted row.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use marshal_db::queries::events::{self, NewEvent};

/// Secret resolution failures. The secret path may appear in errors and
/// logs; the value never does.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("invalid secret reference (expected kind=secret with a path)")]
    InvalidReference,
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret store error for {path}: {message}")]
    Store { path: String, message: String },
}

/// Backend that holds the actual secret material.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, tenant_id: &str, path: &str) -> Result<String, SecretError>;
}

/// Environment-variable-backed store for development: the path
/// `db/prod/password` for tenant `acme` resolves from
/// `MARSHAL_SECRET_ACME_DB_PROD_PASSWORD`.
pub struct EnvSecretStore;

impl EnvSecretStore {
    fn var_name(tenant_id: &str, path: &str) -> String {
        let mut name = String::from("MARSHAL_SECRET_");
        for part in [tenant_id, path] {
            for c in part.chars() {
                if c.is_ascii_alphanumeric() {
                    name.push(c.to_ascii_uppercase());
                } else {
                    name.push('_');
                }
            }
            name.push('_');
        }
        name.pop();
        name
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, tenant_id: &str, path: &str) -> Result<String, SecretError> {
        std::env::var(Self::var_name(tenant_id, path))
            .map_err(|_| SecretError::NotFound(path.to_owned()))
    }
}

/// Fixed-map store for tests and seeded demos.
#[derive(Default)]
pub struct StaticSecretStore {
    values: HashMap<(String, String), String>,
}

impl StaticSecretStore {
    pub fn with(mut self, tenant_id: &str, path: &str, value: &str) -> Self {
        self.values
            .insert((tenant_id.to_owned(), path.to_owned()), value.to_owned());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get(&self, tenant_id: &str, path: &str) -> Result<String, SecretError> {
        self.values
            .get(&(tenant_id.to_owned(), path.to_owned()))
            .cloned()
            .ok_or_else(|| SecretError::NotFound(path.to_owned()))
    }
}

/// Resolves secret references inside step inputs and audits every access.
pub struct SecretResolver {
    pool: PgPool,
    store: std::sync::Arc<dyn SecretStore>,
}

/// If the value is a secret reference, return its path.
pub fn secret_path(value: &serde_json::Value) -> Option<&str> {
    let map = value.as_object()?;
    if map.get("kind").and_then(|k| k.as_str()) == Some("secret") {
        map.get("path").and_then(|p| p.as_str())
    } else {
        None
    }
}

/// True when the value looks like a secret reference, even a malformed one
/// (kind=secret but no usable path).
fn is_secret_shaped(value: &serde_json::Value) -> bool {
    value
        .as_object()
        .and_then(|m| m.get("kind"))
        .and_then(|k| k.as_str())
        == Some("secret")
}

impl SecretResolver {
    pub fn new(pool: PgPool, store: std::sync::Arc<dyn SecretStore>) -> Self {
        Self { pool, store }
    }

    /// Recursively resolve every secret reference in `input`, substituting
    /// each marker with the resolved string in place.
    ///
    /// Emits a `secret_accessed` event per resolution and a
    /// `secret_resolution_failed` event on the first failure (no value in
    /// either). The input itself is not mutated; callers hold the resolved
    /// copy only for the duration of the adapter call.
    pub async fn resolve_all(
        &self,
        input: &serde_json::Value,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> Result<serde_json::Value, SecretError> {
        let mut refs = Vec::new();
        collect_refs(input, String::new(), &mut refs)?;

        if refs.is_empty() {
            return Ok(input.clone());
        }

        let mut resolved = input.clone();
        for (pointer, path) in refs {
            match self.store.get(tenant_id, &path).await {
                Ok(value) => {
                    info!(execution_id = %execution_id, path = %path, "secret resolved");
                    self.audit(
                        execution_id,
                        "secret_accessed",
                        serde_json::json!({"secret_path": path, "tenant_id": tenant_id}),
                    )
                    .await;
                    if let Some(slot) = resolved.pointer_mut(&pointer) {
                        *slot = serde_json::Value::String(value);
                    }
                }
                Err(e) => {
                    warn!(execution_id = %execution_id, path = %path, error = %e, "secret resolution failed");
                    self.audit(
                        execution_id,
                        "secret_resolution_failed",
                        serde_json::json!({"secret_path": path, "error": e.to_string()}),
                    )
                    .await;
                    return Err(e);
                }
            }
        }

        Ok(resolved)
    }

    /// Audit events are best-effort: a failed insert is logged, not raised.
    async fn audit(&self, execution_id: Uuid, event_type: &str, details: serde_json::Value) {
        let event = NewEvent::of(execution_id, event_type, details);
        if let Err(e) = events::insert_event(&self.pool, &event).await {
            warn!(execution_id = %execution_id, error = %e, "failed to persist secret audit event");
        }
    }
}

/// Walk the value, collecting (JSON pointer, secret path) pairs.
fn collect_refs(
    value: &serde_json::Value,
    pointer: String,
    out: &mut Vec<(String, String)>,
) -> Result<(), SecretError> {
    if is_secret_shaped(value) {
        let path = secret_path(value).ok_or(SecretError::InvalidReference)?;
        out.push((pointer, path.to_owned()));
        return Ok(());
    }

    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                collect_refs(val, format!("{pointer}/{escaped}"), out)?;
            }
        }
        serde_json::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_refs(item, format!("{pointer}/{i}"), out)?;
            }
        }
        _ => {}
    }
    Ok(())
}
