//! Canonical plan serialization and the hashes derived from it.
//!
//! Two submissions are "the same" when their canonical bytes are equal:
//! object keys are sorted, numbers use serde_json's fixed formatting, and
//! order-independent plans have their steps sorted by (type, target, name).
//! The idempotency key additionally binds the tenant and actor so identical
//! plans from different principals never collide.

use sha2::{Digest, Sha256};

use super::Plan;

/// Serialize any JSON value with all object keys sorted, recursively.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are plain strings; reuse serde_json's escaping.
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// The canonical JSON form of a plan.
///
/// For order-independent plans the steps are sorted by
/// (declared type, target, name) before serialization, so a reordered
/// resubmission hashes identically.
pub fn canonical_plan(plan: &Plan) -> String {
    let mut plan = plan.clone();
    if plan.order_independent {
        plan.steps.sort_by(|a, b| {
            let key_a = (
                a.step_type.as_str(),
                a.target_asset_id.as_deref().unwrap_or(""),
                a.target_hostname.as_deref().unwrap_or(""),
                a.name.as_deref().unwrap_or(""),
            );
            let key_b = (
                b.step_type.as_str(),
                b.target_asset_id.as_deref().unwrap_or(""),
                b.target_hostname.as_deref().unwrap_or(""),
                b.name.as_deref().unwrap_or(""),
            );
            key_a.cmp(&key_b)
        });
    }

    let value = serde_json::to_value(&plan).unwrap_or(serde_json::Value::Null);
    canonical_json(&value)
}

/// Stable hash of the canonical plan alone. Bound to approvals so the plan
/// cannot change between submission and approval.
pub fn plan_hash(plan: &Plan) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_plan(plan).as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable hash of (canonical plan, tenant, actor). Collapses duplicate
/// submissions within the deduplication window.
pub fn idempotency_key(plan: &Plan, tenant_id: &str, actor_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_plan(plan).as_bytes());
    hasher.update([0]);
    hasher.update(tenant_id.as_bytes());
    hasher.update([0]);
    hasher.update(actor_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use serde_json::json;

    fn plan_from(value: serde_json::Value) -> Plan {
        Plan::from_value(&value).expect("test plan should validate")
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": {"z": 1, "a": [ {"y": 2, "x": 3} ]}, "a": true});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":true,"b":{"a":[{"x":3,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn identical_plans_share_keys() {
        let a = plan_from(json!({
            "name": "p",
            "steps": [{"type": "local-command", "input": {"command": "uptime"}}]
        }));
        let b = a.clone();
        assert_eq!(
            idempotency_key(&a, "t1", "actor"),
            idempotency_key(&b, "t1", "actor")
        );
        assert_eq!(plan_hash(&a), plan_hash(&b));
    }

    #[test]
    fn tenant_and_actor_separate_keys() {
        let plan = plan_from(json!({
            "name": "p",
            "steps": [{"type": "local-command", "input": {"command": "uptime"}}]
        }));
        let base = idempotency_key(&plan, "t1", "a1");
        assert_ne!(base, idempotency_key(&plan, "t2", "a1"));
        assert_ne!(base, idempotency_key(&plan, "t1", "a2"));
        // Plan hash has no principal binding.
        assert_eq!(plan_hash(&plan), plan_hash(&plan));
    }

    #[test]
    fn order_independent_plans_hash_regardless_of_step_order() {
        let forward = plan_from(json!({
            "name": "p",
            "order_independent": true,
            "steps": [
                {"name": "a", "type": "local-command", "input": {"command": "one"}},
                {"name": "b", "type": "local-command", "input": {"command": "two"}}
            ]
        }));
        let reversed = plan_from(json!({
            "name": "p",
            "order_independent": true,
            "steps": [
                {"name": "b", "type": "local-command", "input": {"command": "two"}},
                {"name": "a", "type": "local-command", "input": {"command": "one"}}
            ]
        }));
        assert_eq!(plan_hash(&forward), plan_hash(&reversed));

        // Ordered plans do distinguish step order.
        let ordered_fwd = plan_from(json!({
            "name": "p",
            "steps": [
                {"name": "a", "type": "local-command", "input": {"command": "one"}},
                {"name": "b", "type": "local-command", "input": {"command": "two"}}
            ]
        }));
        let ordered_rev = plan_from(json!({
            "name": "p",
            "steps": [
                {"name": "b", "type": "local-command", "input": {"command": "two"}},
                {"name": "a", "type": "local-command", "input": {"command": "one"}}
            ]
        }));
        assert_ne!(plan_hash(&ordered_fwd), plan_hash(&ordered_rev));
    }

    #[test]
    fn input_differences_change_the_key() {
        let a = plan_from(json!({
            "name": "p",
            "steps": [{"type": "local-command", "input": {"command": "uptime"}}]
        }));
        let b = plan_from(json!({
            "name": "p",
            "steps": [{"type": "local-command", "input": {"command": "whoami"}}]
        }));
        assert_ne!(
            idempotency_key(&a, "t1", "actor"),
            idempotency_key(&b, "t1", "actor")
        );
    }
}
