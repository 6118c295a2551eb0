//! `marshal` -- durable execution engine for infrastructure plans.

mod dlq_cmd;
mod serve_cmd;
mod wiring;
mod work_cmd;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use marshal_core::config::CoreConfig;
use marshal_core::safety::masking::{LogMasker, MaskingMakeWriter};
use marshal_db::config::DbSettings;
use marshal_db::pool;

#[derive(Parser)]
#[command(name = "marshal", version, about = "Durable execution engine for infrastructure plans")]
struct Cli {
    /// Path to a TOML config file. Defaults apply for missing fields.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL; overrides MARSHAL_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database (if needed) and run migrations.
    Init,
    /// Run the HTTP submission API.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8700)]
        port: u16,
        /// JSON file with the asset inventory.
        #[arg(long)]
        assets: Option<PathBuf>,
    },
    /// Run the background worker pool.
    Work {
        /// JSON file with the asset inventory.
        #[arg(long)]
        assets: Option<PathBuf>,
        /// Override the configured worker count.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Inspect and manage the dead-letter queue.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Show queue statistics.
    Stats,
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List dead-letter items.
    List {
        #[arg(long, default_value_t = 50)]
        limit: i64,
        /// Only items that have (or have not) been requeued.
        #[arg(long)]
        requeued: Option<bool>,
    },
    /// Put a dead-lettered execution back on the queue.
    Requeue {
        id: Uuid,
        /// Keep the original attempt count instead of resetting it.
        #[arg(long)]
        keep_attempts: bool,
    },
    /// Archive items older than the configured retention.
    Archive,
    /// Aggregate statistics and top failure reasons.
    Stats,
}

fn init_tracing(masker: Arc<LogMasker>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MaskingMakeWriter::new(std::io::stderr, masker))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let core_config = match &cli.config {
        Some(path) => CoreConfig::from_file(path)?,
        None => CoreConfig::default(),
    };

    let masker = Arc::new(LogMasker::with_defaults(core_config.masking_enabled));
    init_tracing(masker.clone());

    let settings = match &cli.database_url {
        Some(url) => DbSettings::with_url(url.clone()),
        None => DbSettings::from_env(),
    };

    match cli.command {
        Command::Init => {
            let (_pg, summary) = pool::bootstrap(&settings).await?;
            println!("store ready at {}", settings.url);
            println!("  schema version:    {}", summary.schema_version);
            println!("  executions:        {}", summary.executions);
            println!("  queued items:      {}", summary.pending_queue);
            println!("  dead letters:      {}", summary.unarchived_dead_letters);
            println!("  active locks:      {}", summary.active_locks);
            Ok(())
        }
        Command::Serve { bind, port, assets } => {
            let pg = pool::connect(&settings).await?;
            pool::apply_migrations(&pg, &pool::default_migrations_path()).await?;
            let assets = wiring::load_assets(assets.as_deref())?;
            let runtime = wiring::build_runtime(pg, core_config, assets, masker)?;
            serve_cmd::run_serve(runtime, &bind, port).await
        }
        Command::Work { assets, workers } => {
            let pg = pool::connect(&settings).await?;
            pool::apply_migrations(&pg, &pool::default_migrations_path()).await?;
            let assets = wiring::load_assets(assets.as_deref())?;
            let mut config = core_config;
            if let Some(workers) = workers {
                config.worker_count = workers;
            }
            let runtime = wiring::build_runtime(pg, config, assets, masker)?;
            work_cmd::run_workers(runtime).await
        }
        Command::Dlq { command } => {
            let pg = pool::connect(&settings).await?;
            let runtime = wiring::build_runtime(pg, core_config, Vec::new(), masker)?;
            match command {
                DlqCommand::List { limit, requeued } => {
                    dlq_cmd::list(&runtime, limit, requeued).await
                }
                DlqCommand::Requeue { id, keep_attempts } => {
                    dlq_cmd::requeue(&runtime, id, !keep_attempts).await
                }
                DlqCommand::Archive => dlq_cmd::archive(&runtime).await,
                DlqCommand::Stats => dlq_cmd::stats(&runtime).await,
            }
        }
        Command::Stats => {
            let pg = pool::connect(&settings).await?;
            let runtime = wiring::build_runtime(pg, core_config, Vec::new(), masker)?;
            let stats = runtime.queue.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}
