//! Store bootstrap: connecting, migrating, and summarizing the engine's
//! Postgres database.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbSettings;

/// Open a pool sized per [`DbSettings`].
pub async fn connect(settings: &DbSettings) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.pool_size)
        .acquire_timeout(settings.connect_timeout)
        .connect(&settings.url)
        .await
        .with_context(|| format!("cannot reach postgres at {}", settings.url))?;
    Ok(pool)
}

/// Apply pending migrations from a directory.
///
/// The migrator is built at runtime rather than through `sqlx::migrate!`,
/// so compiling this crate never needs a live database.
pub async fn apply_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("no migrations found at {}", dir.display()))?;
    migrator.run(pool).await.context("migration run failed")?;
    Ok(())
}

/// The migrations directory shipped inside this crate's source tree.
///
/// Resolved from `CARGO_MANIFEST_DIR` at compile time. Installed binaries
/// that leave the source tree behind pass their own directory to
/// [`apply_migrations`] instead.
pub fn default_migrations_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations")
}

/// Bring the store fully up: create the database when absent, apply
/// migrations, and return the pool with an operator-facing summary.
pub async fn bootstrap(settings: &DbSettings) -> Result<(PgPool, StoreSummary)> {
    create_database_if_missing(settings).await?;
    let pool = connect(settings).await?;
    apply_migrations(&pool, &default_migrations_path()).await?;
    let summary = summarize(&pool).await?;
    info!(
        schema_version = summary.schema_version,
        executions = summary.executions,
        pending_queue = summary.pending_queue,
        "store ready"
    );
    Ok((pool, summary))
}

/// Issue `CREATE DATABASE` through the admin connection when the target
/// does not exist yet.
async fn create_database_if_missing(settings: &DbSettings) -> Result<()> {
    let name = settings
        .database()
        .context("database URL names no database to create")?;
    // CREATE DATABASE takes no bind parameters; refuse anything that is not
    // a plain identifier rather than interpolating blindly.
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("refusing to create database with unusual name {name:?}");
    }

    let admin_url = settings.admin_url();
    let admin = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(settings.connect_timeout)
        .connect(&admin_url)
        .await
        .with_context(|| format!("cannot reach postgres at {admin_url}"))?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name)
            .fetch_one(&admin)
            .await
            .context("pg_database lookup failed")?;

    if !exists {
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .with_context(|| format!("CREATE DATABASE {name} failed"))?;
        info!(db = name, "database created");
    }

    admin.close().await;
    Ok(())
}

/// What `marshal init` reports: the applied schema version plus the row
/// counts an operator checks right after standing the store up.
#[derive(Debug, Clone)]
pub struct StoreSummary {
    pub schema_version: i64,
    pub executions: i64,
    pub pending_queue: i64,
    pub unarchived_dead_letters: i64,
    pub active_locks: i64,
}

/// Gather the [`StoreSummary`] in a single round trip.
pub async fn summarize(pool: &PgPool) -> Result<StoreSummary> {
    let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
        "SELECT \
             (SELECT COALESCE(MAX(version), 0) FROM _sqlx_migrations), \
             (SELECT COUNT(*) FROM executions), \
             (SELECT COUNT(*) FROM execution_queue WHERE status = 'pending'), \
             (SELECT COUNT(*) FROM execution_dlq WHERE NOT archived), \
             (SELECT COUNT(*) FROM asset_locks WHERE is_active)",
    )
    .fetch_one(pool)
    .await
    .context("store summary query failed")?;

    Ok(StoreSummary {
        schema_version: row.0,
        executions: row.1,
        pending_queue: row.2,
        unarchived_dead_letters: row.3,
        active_locks: row.4,
    })
}
