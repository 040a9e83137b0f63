//! `runledger` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    — start the API server and the lost-run sweeper.
//! - `sweep`    — run the lost-run sweeper without the API.
//! - `migrate`  — run pending database migrations.
//! - `validate` — validate a workflow graph JSON file.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use db::{MemoryStore, PgStore, RunStore};
use engine::{EngineConfig, GraphDefinition, GraphSnapshot, LostRunSweeper, RunEngine};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "runledger",
    about = "Run execution and retry engine for workflow graphs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[arg(long, env = "RUNLEDGER_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
        /// Keep all state in process memory instead of Postgres.
        #[arg(long)]
        in_memory: bool,
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Mark runs with no recent worker activity as lost.
    Sweep {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        /// Sweep a single time and exit instead of looping.
        #[arg(long)]
        once: bool,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate a workflow graph JSON file.
    Validate {
        /// Path to a snapshot or bare graph definition.
        path: std::path::PathBuf,
    },
}

#[derive(Args)]
struct EngineArgs {
    /// Seconds without worker activity before a run is lost.
    #[arg(long, env = "RUNLEDGER_LOST_TIMEOUT_SECS", default_value_t = 600)]
    lost_timeout_secs: u64,
    #[arg(long, env = "RUNLEDGER_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    sweep_interval_secs: u64,
    /// Cap for workflows whose project sets none. Unlimited when omitted.
    #[arg(long, env = "RUNLEDGER_DEFAULT_CONCURRENCY")]
    default_concurrency: Option<u32>,
    #[arg(long, env = "RUNLEDGER_DB_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
}

impl EngineArgs {
    fn config(&self) -> EngineConfig {
        EngineConfig {
            lost_timeout: Duration::from_secs(self.lost_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            project_concurrency: self.default_concurrency,
            ..EngineConfig::default()
        }
    }
}

async fn postgres_store(database_url: &str, max_connections: u32) -> Result<Arc<dyn RunStore>> {
    let pool = db::pool::create_pool(database_url, max_connections)
        .await
        .context("failed to connect to database")?;
    Ok(Arc::new(PgStore::new(pool)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            in_memory,
            database_url,
            engine,
        } => {
            let store: Arc<dyn RunStore> = match (in_memory, database_url) {
                (true, _) => {
                    warn!("Using in-memory store; state is lost on exit");
                    Arc::new(MemoryStore::new())
                }
                (false, Some(url)) => postgres_store(&url, engine.max_connections).await?,
                (false, None) => bail!("either --database-url or --in-memory is required"),
            };
            let engine = Arc::new(RunEngine::new(store, engine.config()));
            let sweeper = LostRunSweeper::spawn(engine.clone());

            info!("Starting API server on {bind}");
            let served = api::serve(&bind, engine, shutdown_signal()).await;
            sweeper.shutdown().await;
            served.with_context(|| format!("API server on {bind} failed"))?;
        }
        Command::Sweep {
            database_url,
            once,
            engine,
        } => {
            let store = postgres_store(&database_url, engine.max_connections).await?;
            let engine = Arc::new(RunEngine::new(store, engine.config()));
            if once {
                let lost = engine.sweep_lost(chrono::Utc::now()).await?;
                info!(count = lost.len(), "Sweep finished");
                for run_id in lost {
                    println!("{run_id}");
                }
            } else {
                let sweeper = LostRunSweeper::spawn(engine);
                shutdown_signal().await;
                sweeper.shutdown().await;
            }
        }
        Command::Migrate { database_url } => {
            info!("Running migrations against {database_url}");
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool)
                .await
                .context("migration failed")?;
            info!("Migrations applied successfully");
        }
        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read file {}", path.display()))?;

            let snapshot = match serde_json::from_str::<GraphSnapshot>(&content) {
                Ok(snapshot) => snapshot,
                Err(_) => {
                    let graph: GraphDefinition =
                        serde_json::from_str(&content).context("invalid graph JSON")?;
                    GraphSnapshot::new(Uuid::nil(), 0, graph)
                }
            };

            match engine::validate_snapshot(&snapshot) {
                Ok(order) => {
                    println!("Graph is valid. Execution order:");
                    for id in order {
                        let name = snapshot.job(id).map_or("?", |j| j.name.as_str());
                        println!("  {id}  {name}");
                    }
                }
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}
