//! `workflow-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a workflow definition JSON file.
//! - `run`     : register a definition, start an instance and execute it.
//! - `migrate` : run pending database migrations.
//! - `cleanup` : purge old finished instances from the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use engine::{
    EngineConfig, InstanceStatus, MemoryPersistence, PgPersistence, SimpleConditionEvaluator,
    WorkflowDefinition, WorkflowEngine, WorkflowExecutor, WorkflowPersistence,
};
use processors::builtin::register_builtins;
use processors::ProcessorRegistry;

/// Budget for a single store call and for acquiring a pooled connection.
const STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "workflow-engine",
    about = "DAG workflow orchestration engine",
    version
)]
struct Cli {
    /// Engine configuration file (JSON). Missing keys use their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Register a definition, start one instance and run it to completion.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Initial instance context, as a JSON object.
        #[arg(long)]
        params: Option<String>,
        /// Persist instances in Postgres; in memory when unset.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Delete finished instances that ended more than `older_than_secs` ago.
    Cleanup {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        #[arg(long, default_value_t = 86_400)]
        older_than_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Validate { path } => {
            let definition = read_definition(&path)?;
            let topology = definition.validate_topology();
            if topology.has_cycle() {
                bail!(
                    "❌ Validation failed: cycle among {:?}",
                    topology.unresolved_nodes()
                );
            }
            println!("✅ Workflow '{}' is valid.", definition.name());
            for (wave, nodes) in topology.layers().iter().enumerate() {
                println!("  wave {wave}: {nodes:?}");
            }
        }
        Command::Run {
            path,
            params,
            database_url,
        } => {
            let definition = read_definition(&path)?;
            let params = params
                .as_deref()
                .map(serde_json::from_str::<Map<String, Value>>)
                .transpose()
                .context("--params must be a JSON object")?;

            let durable = database_url.is_some();
            let engine = build_engine(config, database_url.as_deref()).await?;
            if durable {
                let recovered = engine.recover_running_instances().await?;
                info!("{recovered} unfinished instances loaded from the store");
            }

            let definition = engine.create_workflow(definition)?;
            let instance = engine.start_workflow(definition.id(), params).await?;
            let log = engine.run(&definition, &instance).await?;
            engine.shutdown();

            println!("{}", serde_json::to_string_pretty(&log)?);
            if log.status == InstanceStatus::Failed {
                bail!(
                    "instance {} failed: {}",
                    log.instance_id,
                    log.error_message.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Command::Migrate { database_url } => {
            info!("Running migrations");
            let pool = db::pool::create_pool(&database_url, 2, STORE_TIMEOUT).await?;
            db::pool::run_migrations(&pool).await?;
            info!("Migrations applied successfully");
        }
        Command::Cleanup {
            database_url,
            older_than_secs,
        } => {
            let engine = build_engine(config, Some(&database_url)).await?;
            let removed = engine
                .cleanup_expired_instances(Duration::from_secs(older_than_secs))
                .await?;
            println!("Removed {removed} expired instances");
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&content)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn read_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow definition {}", path.display()))
}

async fn build_engine(config: EngineConfig, database_url: Option<&str>) -> anyhow::Result<WorkflowEngine> {
    let persistence: Arc<dyn WorkflowPersistence> = match database_url {
        Some(url) => {
            let pool = db::pool::create_pool(url, 5, STORE_TIMEOUT).await?;
            Arc::new(PgPersistence::new(pool, STORE_TIMEOUT))
        }
        None => Arc::new(MemoryPersistence::new()),
    };

    let registry = Arc::new(ProcessorRegistry::new());
    register_builtins(&registry)?;

    let executor = WorkflowExecutor::new(registry, Arc::new(SimpleConditionEvaluator), config.executor_config());
    Ok(WorkflowEngine::new(config, executor, persistence)?)
}
