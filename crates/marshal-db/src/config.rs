//! Connection settings for the engine's Postgres store.

use std::env;
use std::time::Duration;

/// Where and how to connect. Everything is environment-driven so one binary
/// serves compose files, CI, and local development:
///
/// - `MARSHAL_DATABASE_URL`: connection string
///   (default `postgresql://localhost:5432/marshal`)
/// - `MARSHAL_DB_POOL_SIZE`: maximum pool connections (default 10)
/// - `MARSHAL_DB_CONNECT_TIMEOUT_SECONDS`: acquire timeout (default 10)
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub url: String,
    pub pool_size: u32,
    pub connect_timeout: Duration,
}

fn env_number(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl DbSettings {
    /// Read settings from the environment, with defaults for anything
    /// unset or unparsable.
    pub fn from_env() -> Self {
        let url = env::var("MARSHAL_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost:5432/marshal".to_owned());
        Self {
            url,
            pool_size: env_number("MARSHAL_DB_POOL_SIZE", 10) as u32,
            connect_timeout: Duration::from_secs(env_number(
                "MARSHAL_DB_CONNECT_TIMEOUT_SECONDS",
                10,
            )),
        }
    }

    /// Settings for an explicit URL (CLI flag, tests); sizing stays at the
    /// defaults.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// The target database name: the final path segment of the URL, with
    /// any query string stripped. `None` when the URL carries no database
    /// (e.g. `postgresql://host:5432`).
    pub fn database(&self) -> Option<&str> {
        let without_params = self.url.split('?').next().unwrap_or(&self.url);
        without_params
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty() && !s.contains(':') && !s.contains('@'))
    }

    /// The same server's `postgres` maintenance database, used for
    /// `CREATE DATABASE` before the target exists.
    pub fn admin_url(&self) -> String {
        let without_params = self.url.split('?').next().unwrap_or(&self.url);
        match self.database() {
            Some(name) => {
                let base = &without_params[..without_params.len() - name.len()];
                format!("{base}postgres")
            }
            None => format!("{}/postgres", without_params.trim_end_matches('/')),
        }
    }
}

impl Default for DbSettings {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_is_last_path_segment() {
        let s = DbSettings::with_url("postgresql://db.internal:5432/marshal");
        assert_eq!(s.database(), Some("marshal"));
    }

    #[test]
    fn query_string_does_not_pollute_the_name() {
        let s = DbSettings::with_url("postgresql://db.internal:5432/marshal?sslmode=require");
        assert_eq!(s.database(), Some("marshal"));
        assert_eq!(s.admin_url(), "postgresql://db.internal:5432/postgres");
    }

    #[test]
    fn url_without_database_yields_none() {
        let s = DbSettings::with_url("postgresql://db.internal:5432");
        assert_eq!(s.database(), None);
        assert_eq!(s.admin_url(), "postgresql://db.internal:5432/postgres");
    }

    #[test]
    fn userinfo_is_not_mistaken_for_a_name() {
        let s = DbSettings::with_url("postgresql://svc:pw@db.internal:5432/ops");
        assert_eq!(s.database(), Some("ops"));
        assert_eq!(s.admin_url(), "postgresql://svc:pw@db.internal:5432/postgres");
    }

    #[test]
    fn with_url_uses_default_sizing() {
        let s = DbSettings::with_url("postgresql://localhost/x");
        assert_eq!(s.pool_size, 10);
        assert_eq!(s.connect_timeout, Duration::from_secs(10));
    }
}
