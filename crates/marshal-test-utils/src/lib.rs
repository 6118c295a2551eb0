//! Postgres harness for marshal's integration tests.
//!
//! Every test gets its own database cloned from a pre-migrated template,
//! so the migration cost is paid once per test binary instead of once per
//! test. The server comes from `MARSHAL_TEST_PG_URL` when set (CI points
//! this at a prepared instance); otherwise a testcontainers Postgres is
//! started lazily and shared for the life of the binary.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use marshal_db::pool::{apply_migrations, default_migrations_path};

/// Name of the migrated template every test database is cloned from.
const TEMPLATE_DB: &str = "marshal_template";

struct PgServer {
    base_url: String,
    /// Keeps the container alive for the life of the test binary; absent
    /// when an external server is adopted.
    _container: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn admin_pool(base_url: &str) -> PgPool {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{base_url}/postgres"))
        .await
        .expect("admin connection to test postgres failed")
}

/// Start (or adopt) the server, then build the migrated template database.
async fn server() -> &'static PgServer {
    SERVER
        .get_or_init(|| async {
            let (base_url, container) = match std::env::var("MARSHAL_TEST_PG_URL") {
                Ok(url) => (url, None),
                Err(_) => {
                    let container = Postgres::default()
                        .with_tag("18")
                        .start()
                        .await
                        .expect("failed to start postgres container");
                    let host = container.get_host().await.expect("container host");
                    let port = container
                        .get_host_port_ipv4(5432)
                        .await
                        .expect("container port");
                    (
                        format!("postgresql://postgres:postgres@{host}:{port}"),
                        Some(container),
                    )
                }
            };

            // Rebuild the template from scratch so a stale schema left by an
            // earlier binary on an external server cannot leak in.
            let admin = admin_pool(&base_url).await;
            admin
                .execute(format!("DROP DATABASE IF EXISTS {TEMPLATE_DB}").as_str())
                .await
                .expect("dropping stale template failed");
            admin
                .execute(format!("CREATE DATABASE {TEMPLATE_DB}").as_str())
                .await
                .expect("creating template failed");

            let template = PgPoolOptions::new()
                .max_connections(2)
                .acquire_timeout(Duration::from_secs(30))
                .connect(&format!("{base_url}/{TEMPLATE_DB}"))
                .await
                .expect("template connection failed");
            apply_migrations(&template, &default_migrations_path())
                .await
                .expect("migrating template failed");
            // A template with live connections cannot be cloned.
            template.close().await;
            admin.close().await;

            PgServer {
                base_url,
                _container: container,
            }
        })
        .await
}

/// One isolated, fully migrated database.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    /// Clone the template into a fresh database and connect to it.
    pub async fn new() -> Self {
        let server = server().await;
        let name = format!("marshal_it_{}", Uuid::new_v4().simple());

        let admin = admin_pool(&server.base_url).await;
        let create = format!("CREATE DATABASE {name} TEMPLATE {TEMPLATE_DB}");
        // Clones briefly contend on the template lock when a binary's tests
        // start in parallel; a short retry absorbs that.
        let mut attempts = 0;
        loop {
            match admin.execute(create.as_str()).await {
                Ok(_) => break,
                Err(_) if attempts < 5 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(e) => panic!("cloning template into {name} failed: {e}"),
            }
        }
        admin.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{}/{name}", server.base_url))
            .await
            .unwrap_or_else(|e| panic!("connection to {name} failed: {e}"));

        Self { pool, name }
    }

    /// Close the pool and drop the database. Call at the end of each test;
    /// anything leaked by a panicking test stays confined to the throwaway
    /// container (or is swept by the next template rebuild).
    pub async fn cleanup(self) {
        self.pool.close().await;

        let server = server().await;
        let admin = admin_pool(&server.base_url).await;
        let _ = admin
            .execute(
                format!(
                    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                     WHERE datname = '{}' AND pid <> pg_backend_pid()",
                    self.name
                )
                .as_str(),
            )
            .await;
        let _ = admin
            .execute(format!("DROP DATABASE IF EXISTS {}", self.name).as_str())
            .await;
        admin.close().await;
    }
}
