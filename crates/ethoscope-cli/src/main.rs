//! Ethoscope CLI - Ethereum network health monitoring
//!
//! Usage:
//!   ethoscope init                Write a default ethoscope.toml
//!   ethoscope check-config        Validate and print the effective configuration
//!   ethoscope run                 Run the pipeline until Ctrl+C
//!   ethoscope collect-once        Run one collection cycle and print the batches
//!   ethoscope score               Score stored history once and print the record

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ethoscope_collectors::build_registry;
use ethoscope_core::EthoscopeConfig;
use ethoscope_health::HealthScoreCalculator;
use ethoscope_metrics::{open_store, StorageMode};
use ethoscope_orchestrator::{BroadcastEventBus, CollectorOutcome, Pipeline};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "ethoscope")]
#[command(author, version, about = "Ethereum network health monitoring pipeline")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "ethoscope.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init {
        /// Where to write it (defaults to --config)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Run collection and scoring until Ctrl+C
    Run {
        /// Directory for the append-only metric files
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep metrics in memory only
        #[arg(long, conflicts_with = "data_dir")]
        memory: bool,

        /// Print every published event as a JSON line
        #[arg(long)]
        print_events: bool,
    },

    /// Run one collection cycle and print the processed batches
    CollectOnce,

    /// Score stored history once and print the record
    Score {
        /// Directory holding the append-only metric files
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format)?;

    match cli.command {
        Commands::Init { path, force } => cmd_init(path.unwrap_or(cli.config), force),
        Commands::CheckConfig => cmd_check_config(&cli.config),
        Commands::Run {
            data_dir,
            memory,
            print_events,
        } => cmd_run(&cli.config, data_dir, memory, print_events).await,
        Commands::CollectOnce => cmd_collect_once(&cli.config).await,
        Commands::Score { data_dir } => cmd_score(&cli.config, data_dir).await,
    }
}

/// `RUST_LOG` wins; otherwise `--verbose` picks debug over info
fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<EthoscopeConfig> {
    EthoscopeConfig::load(path)
        .with_context(|| format!("Invalid configuration ({})", path.display()))
}

fn build_pipeline(
    config: &EthoscopeConfig,
    storage: &StorageMode,
    bus: Arc<BroadcastEventBus>,
) -> Result<Arc<Pipeline>> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("ethoscope/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let registry = build_registry(config, client).context("Failed to build collectors")?;
    info!(collectors = ?registry.ids(), "Collectors registered");

    let pipeline = Pipeline::new(config, registry, open_store(storage), bus)?;
    Ok(Arc::new(pipeline))
}

fn cmd_init(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    EthoscopeConfig::write_default(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Wrote default configuration to {}", path.display());
    println!("Set $ALCHEMY_API_URL or edit collectors.mainnet.rpc_url before running.");
    Ok(())
}

fn cmd_check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;

    println!("Configuration OK ({})", path.display());
    println!(
        "  collectors: {}",
        config
            .enabled_collectors()
            .map(|(id, settings)| format!("{} ({})", id, settings.kind))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  weights sum: {:.6}", config.scoring.weights.sum());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn cmd_run(
    config_path: &Path,
    data_dir: Option<PathBuf>,
    memory: bool,
    print_events: bool,
) -> Result<()> {
    let config = load_config(config_path)?;

    let storage = if memory {
        StorageMode::Memory
    } else {
        StorageMode::AppendFile(data_dir.unwrap_or_else(|| config.storage.data_dir.clone()))
    };

    let bus = Arc::new(BroadcastEventBus::default());
    if print_events {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Failed to encode event: {}", e),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let pipeline = build_pipeline(&config, &storage, bus)?;

    println!("Starting Ethoscope pipeline...");
    match &storage {
        StorageMode::Memory => println!("  Storage: in-memory"),
        StorageMode::AppendFile(dir) => println!("  Storage: {}", dir.display()),
    }
    println!(
        "  Collection every {}s, scoring every {}s",
        config.pipeline.collection_interval_secs, config.pipeline.scoring_interval_secs
    );
    println!("  Press Ctrl+C to stop");
    println!();

    let mut running = tokio::spawn(Arc::clone(&pipeline).run());

    tokio::select! {
        result = &mut running => {
            result.context("Pipeline task failed")??;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            pipeline.stop();
            running.await.context("Pipeline task failed")??;
        }
    }

    let summary = pipeline.telemetry().summary().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("Pipeline stopped");
    Ok(())
}

async fn cmd_collect_once(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let pipeline = build_pipeline(
        &config,
        &StorageMode::Memory,
        Arc::new(BroadcastEventBus::default()),
    )?;

    let report = pipeline.run_collection_cycle().await?;
    for (id, outcome) in &report.outcomes {
        if !matches!(outcome, CollectorOutcome::Collected { .. }) {
            warn!(collector = %id, ?outcome, "Collector produced no data");
        }
    }

    println!("{}", serde_json::to_string_pretty(&report.processed.batches)?);
    Ok(())
}

async fn cmd_score(config_path: &Path, data_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let dir = data_dir.unwrap_or_else(|| config.storage.data_dir.clone());
    if !dir.exists() {
        bail!("No stored metrics at {} (run `ethoscope run` first)", dir.display());
    }

    let calculator = HealthScoreCalculator::new(
        open_store(&StorageMode::AppendFile(dir)),
        &config.scoring,
    );
    let record = calculator.calculate().await?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
