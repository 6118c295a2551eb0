//! Runtime configuration for the execution core.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use marshal_db::models::SlaClass;

/// Tunables for queueing, leasing, locking, safety, and routing.
///
/// Loadable from a TOML file; every field has a default so a partial file
/// (or none at all) is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Queue lease duration granted on dequeue.
    pub lease_duration_seconds: i64,
    /// How often workers renew their lease. Must be well under the lease
    /// duration.
    pub lease_renewal_interval_seconds: u64,
    /// Default visibility timeout recorded on queue rows.
    pub visibility_timeout_seconds: i32,
    /// Worker sleep between empty polls.
    pub poll_interval_seconds: u64,
    /// Number of workers the pool starts with.
    pub worker_count: usize,
    /// Items claimed per dequeue call.
    pub batch_size: i64,
    /// Asset locks with no heartbeat for this long are reapable.
    pub stale_lock_threshold_seconds: i64,
    /// Asset lock heartbeat interval. Must be well under the lock lease.
    pub heartbeat_interval_seconds: u64,
    /// Asset lock lease duration.
    pub lock_lease_duration_seconds: i64,
    /// How long a step waits for a contended asset lock before failing.
    pub lock_wait_seconds: u64,
    /// Window within which identical submissions are deduplicated.
    pub deduplication_window_hours: i64,
    /// Budget for compensation hooks after cancellation.
    pub cleanup_timeout_seconds: u64,
    /// Fractional headroom added to the sum of step timeouts.
    pub execution_timeout_buffer: f64,
    /// Deny-by-default RBAC. Disable only in development.
    pub rbac_strict: bool,
    /// Master switch for sink-level log masking.
    pub masking_enabled: bool,
    /// Per-step duration estimate used to pick an SLA class at submission.
    pub inline_step_estimate_seconds: f64,
    /// Estimated durations at or below this are `fast` (and run inline).
    pub sla_fast_max_seconds: f64,
    /// Estimated durations at or below this are `medium`; above is `long`.
    pub sla_medium_max_seconds: f64,
    /// Queue re-dispatch bounds per SLA class.
    pub max_attempts_fast: i32,
    pub max_attempts_medium: i32,
    pub max_attempts_long: i32,
    /// Pool maintenance cadence (health checks, lease/lock reaping,
    /// timeout sweep).
    pub health_check_interval_seconds: u64,
    /// How long `stop` waits for in-flight work before giving up.
    pub drain_timeout_seconds: u64,
    /// Dead-letter rows older than this are archived.
    pub dlq_archive_after_days: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lease_duration_seconds: 300,
            lease_renewal_interval_seconds: 60,
            visibility_timeout_seconds: 300,
            poll_interval_seconds: 5,
            worker_count: 3,
            batch_size: 1,
            stale_lock_threshold_seconds: 600,
            heartbeat_interval_seconds: 30,
            lock_lease_duration_seconds: 300,
            lock_wait_seconds: 30,
            deduplication_window_hours: 24,
            cleanup_timeout_seconds: 30,
            execution_timeout_buffer: 0.10,
            rbac_strict: true,
            masking_enabled: true,
            inline_step_estimate_seconds: 2.0,
            sla_fast_max_seconds: 10.0,
            sla_medium_max_seconds: 60.0,
            max_attempts_fast: 2,
            max_attempts_medium: 3,
            max_attempts_long: 5,
            health_check_interval_seconds: 30,
            drain_timeout_seconds: 30,
            dlq_archive_after_days: 30,
        }
    }
}

impl CoreConfig {
    /// Load a config from a TOML file, falling back to defaults for any
    /// field the file omits.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Queue re-dispatch bound for an SLA class.
    pub fn max_attempts(&self, sla_class: SlaClass) -> i32 {
        match sla_class {
            SlaClass::Fast => self.max_attempts_fast,
            SlaClass::Medium => self.max_attempts_medium,
            SlaClass::Long => self.max_attempts_long,
        }
    }

    /// Queue priority for an SLA class (1 = highest, 10 = lowest).
    pub fn priority(&self, sla_class: SlaClass) -> i32 {
        match sla_class {
            SlaClass::Fast => 1,
            SlaClass::Medium => 5,
            SlaClass::Long => 10,
        }
    }

    /// Classify an estimated duration into an SLA class.
    pub fn sla_for_estimate(&self, estimated_seconds: f64) -> SlaClass {
        if estimated_seconds <= self.sla_fast_max_seconds {
            SlaClass::Fast
        } else if estimated_seconds <= self.sla_medium_max_seconds {
            SlaClass::Medium
        } else {
            SlaClass::Long
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.lease_duration_seconds, 300);
        assert_eq!(cfg.lease_renewal_interval_seconds, 60);
        assert_eq!(cfg.poll_interval_seconds, 5);
        assert_eq!(cfg.worker_count, 3);
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.deduplication_window_hours, 24);
        assert_eq!(cfg.cleanup_timeout_seconds, 30);
        assert!(cfg.rbac_strict);
        assert!(cfg.masking_enabled);
    }

    #[test]
    fn sla_attempt_bounds() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.max_attempts(SlaClass::Fast), 2);
        assert_eq!(cfg.max_attempts(SlaClass::Medium), 3);
        assert_eq!(cfg.max_attempts(SlaClass::Long), 5);
    }

    #[test]
    fn sla_classification_thresholds() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.sla_for_estimate(4.0), SlaClass::Fast);
        assert_eq!(cfg.sla_for_estimate(10.0), SlaClass::Fast);
        assert_eq!(cfg.sla_for_estimate(30.0), SlaClass::Medium);
        assert_eq!(cfg.sla_for_estimate(120.0), SlaClass::Long);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg: CoreConfig = toml::from_str("worker_count = 8\nrbac_strict = false").unwrap();
        assert_eq!(cfg.worker_count, 8);
        assert!(!cfg.rbac_strict);
        assert_eq!(cfg.lease_duration_seconds, 300);
    }
}
