//! Asset inventory types and the in-memory backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AdapterError, AssetService};

/// One inventory entry, as the engine sees it.
///
/// Credentials are deliberately absent: connection secrets arrive through
/// step inputs as secret references and are resolved at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Operating system family, e.g. "linux" or "windows". Used as the last
    /// fallback when classifying a step.
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub asset_type: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AssetRecord {
    /// The address to connect to: IP when known, hostname otherwise.
    pub fn address(&self) -> &str {
        self.ip_address.as_deref().unwrap_or(&self.hostname)
    }

    /// Project the record down to the requested fields (empty = all).
    pub fn project(&self, fields: &[String]) -> serde_json::Value {
        let full = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if fields.is_empty() {
            return full;
        }
        let mut out = serde_json::Map::new();
        if let serde_json::Value::Object(map) = full {
            for field in fields {
                if let Some(value) = map.get(field) {
                    out.insert(field.clone(), value.clone());
                }
            }
        }
        serde_json::Value::Object(out)
    }
}

/// In-memory inventory, loaded at startup. Suitable for development and
/// tests; production deployments wire a client for their inventory service
/// behind the same trait.
pub struct StaticAssets {
    records: Vec<AssetRecord>,
}

impl StaticAssets {
    pub fn new(records: Vec<AssetRecord>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self { records: Vec::new() }
    }
}

#[async_trait]
impl AssetService for StaticAssets {
    async fn get_by_id(&self, asset_id: &str) -> Result<Option<AssetRecord>, AdapterError> {
        Ok(self.records.iter().find(|a| a.id == asset_id).cloned())
    }

    async fn get_by_hostname(&self, hostname: &str) -> Result<Option<AssetRecord>, AdapterError> {
        Ok(self
            .records
            .iter()
            .find(|a| a.hostname.eq_ignore_ascii_case(hostname))
            .cloned())
    }

    async fn list_all(&self, limit: usize) -> Result<Vec<AssetRecord>, AdapterError> {
        Ok(self.records.iter().take(limit).cloned().collect())
    }

    async fn list_by_type(
        &self,
        asset_type: &str,
        limit: usize,
    ) -> Result<Vec<AssetRecord>, AdapterError> {
        Ok(self
            .records
            .iter()
            .filter(|a| a.asset_type.as_deref() == Some(asset_type))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<usize, AdapterError> {
        Ok(self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> StaticAssets {
        StaticAssets::new(vec![
            AssetRecord {
                id: "web-1".into(),
                hostname: "web-1.internal".into(),
                ip_address: Some("10.0.0.10".into()),
                os_type: Some("linux".into()),
                asset_type: Some("server".into()),
                environment: Some("prod".into()),
                metadata: serde_json::json!({}),
            },
            AssetRecord {
                id: "db-1".into(),
                hostname: "db-1.internal".into(),
                ip_address: None,
                os_type: Some("linux".into()),
                asset_type: Some("database".into()),
                environment: Some("prod".into()),
                metadata: serde_json::json!({}),
            },
        ])
    }

    #[tokio::test]
    async fn lookups_work() {
        let assets = inventory();
        assert!(assets.get_by_id("web-1").await.unwrap().is_some());
        assert!(assets.get_by_id("nope").await.unwrap().is_none());
        assert!(assets.get_by_hostname("DB-1.INTERNAL").await.unwrap().is_some());
        assert_eq!(assets.count().await.unwrap(), 2);
        assert_eq!(assets.list_by_type("database", 10).await.unwrap().len(), 1);
    }

    #[test]
    fn address_prefers_ip() {
        let records = inventory().records;
        assert_eq!(records[0].address(), "10.0.0.10");
        assert_eq!(records[1].address(), "db-1.internal");
    }

    #[test]
    fn projection_filters_fields() {
        let record = inventory().records[0].clone();
        let projected = record.project(&["id".into(), "hostname".into()]);
        let map = projected.as_object().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["id"], "web-1");
    }
}
