//! shardboot - bootstrap a sharded MongoDB cluster.
//!
//! # Usage
//!
//! ```bash
//! # Bootstrap with the reference topology (mongos:27017, vesselDB)
//! shardboot
//!
//! # Bootstrap from a configuration file, ignoring earlier progress
//! shardboot --config cluster.toml bootstrap --fresh
//!
//! # Show registered shards and sharded collections
//! shardboot --config cluster.toml status
//!
//! # Rehearse against an in-process simulated cluster
//! shardboot --simulate
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shardboot::admin::{ClusterAdmin, SimulatedCluster};
use shardboot::bootstrap::{CheckpointStore, Orchestrator, ShardRegistrar};
use shardboot::config::{Backend, BootstrapConfig, LoggingConfig};
use shardboot::topology::ClusterTopology;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(feature = "mongo")]
use shardboot::admin::MongoAdmin;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(
    name = "shardboot",
    about = "Form config-server and shard replica sets, register shards and enable sharding",
    version
)]
struct CliArgs {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Enable JSON log output.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Use the simulated backend regardless of configuration.
    #[arg(long, global = true)]
    simulate: bool,

    /// Print the default configuration and exit.
    #[arg(long)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run (or resume) the bootstrap. This is the default.
    Bootstrap {
        /// Ignore and delete any existing checkpoint first.
        #[arg(long)]
        fresh: bool,
    },
    /// Report registered shards and collection shard keys.
    Status,
    /// Delete the checkpoint so the next run starts from the beginning.
    Reset,
}

/// Initialize tracing/logging.
fn init_tracing(config: &LoggingConfig, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to parse log filter")?;

    let format = if json_logs { "json" } else { config.format.as_str() };

    match format {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        "pretty" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}

fn build_admin(
    config: &BootstrapConfig,
    topology: &ClusterTopology,
) -> Result<Arc<dyn ClusterAdmin>> {
    match config.cluster.backend {
        Backend::Simulated => {
            info!("Using simulated cluster backend");
            Ok(Arc::new(SimulatedCluster::for_topology(topology)))
        }
        #[cfg(feature = "mongo")]
        Backend::Mongo => {
            let timeout = config.orchestrator_options().poll.probe_timeout;
            Ok(Arc::new(MongoAdmin::new(timeout)))
        }
        #[cfg(not(feature = "mongo"))]
        Backend::Mongo => anyhow::bail!(
            "built without the 'mongo' feature; set backend = \"simulated\" or pass --simulate"
        ),
    }
}

fn checkpoint_store(config: &BootstrapConfig) -> Option<CheckpointStore> {
    config.cluster.checkpoint_path.clone().map(CheckpointStore::new)
}

async fn bootstrap(config: &BootstrapConfig, fresh: bool) -> Result<ExitCode> {
    let topology = config.topology().context("Invalid topology")?;
    let admin = build_admin(config, &topology)?;

    let mut orchestrator = Orchestrator::new(topology, admin, config.orchestrator_options());
    match checkpoint_store(config) {
        // A fresh simulated cluster has none of the recorded progress
        Some(_) if config.cluster.backend == Backend::Simulated => {
            warn!("Checkpoint ignored for the simulated backend");
        }
        Some(store) => {
            if fresh {
                store.clear().await?;
            }
            orchestrator = orchestrator.with_checkpoint(store);
        }
        None => {}
    }

    let outcome = orchestrator.run().await;
    if let Some(phase) = outcome.resumed_from {
        println!(
            "Resumed after phase {} (run `shardboot reset` or `bootstrap --fresh` after a topology change)",
            phase
        );
    }
    if let Some(e) = &outcome.checkpoint_error {
        eprintln!("warning: progress was not saved, a rerun will not resume: {}", e);
    }
    match outcome.failure() {
        None => println!("Bootstrap reached {} in {:?}", outcome.state, outcome.elapsed),
        Some((phase, cause)) => {
            eprintln!("Bootstrap failed at phase {}", phase);
            eprintln!("  error: {}", cause.kind());
            eprintln!("  cause: {}", cause);
        }
    }
    Ok(ExitCode::from(outcome.exit_code() as u8))
}

async fn status(config: &BootstrapConfig) -> Result<ExitCode> {
    let topology = config.topology().context("Invalid topology")?;
    let admin = build_admin(config, &topology)?;

    if let Some(store) = checkpoint_store(config) {
        match store.load().await? {
            Some(c) => println!("Checkpoint: {} at {}", c.phase, c.completed_at.to_rfc3339()),
            None => println!("Checkpoint: none"),
        }
    }

    let registrar = ShardRegistrar::new(admin.clone(), topology.router.clone());
    let shards = registrar.registered().await?;
    println!("Router {}: {} shard(s)", topology.router, shards.len());
    for shard in &shards {
        println!("  {} {}", shard.name, shard.host);
    }

    let database = &topology.sharding.database;
    for collection in topology.sharding.collections.keys() {
        let key = admin
            .collection_shard_key(&topology.router, database, collection)
            .await
            .with_context(|| format!("Failed to read shard key of {}.{}", database, collection))?;
        match key {
            Some(key) => println!("  {}.{} sharded on {}", database, collection, key),
            None => println!("  {}.{} not sharded", database, collection),
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = CliArgs::parse();

    if args.print_config {
        println!("{}", BootstrapConfig::default().to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = match &args.config {
        Some(path) => BootstrapConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => BootstrapConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.simulate {
        config.cluster.backend = Backend::Simulated;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging, args.json_logs)?;
    info!(version = env!("CARGO_PKG_VERSION"), "shardboot starting");

    match args.command.unwrap_or(Command::Bootstrap { fresh: false }) {
        Command::Bootstrap { fresh } => bootstrap(&config, fresh).await,
        Command::Status => status(&config).await,
        Command::Reset => {
            match checkpoint_store(&config) {
                Some(store) => store.clear().await?,
                None => println!("No checkpoint path configured"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
