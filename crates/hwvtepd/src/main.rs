//! HWVTEP HA daemon
//!
//! Starts the HA aggregation and reconciliation engine against an
//! in-memory store and runs until ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use hwvtep_ha::{DeviceTransactor, HaEngine, RecordingTransactor, StoreTransactor};
use hwvtep_store::{DataBroker, MemoryBroker};
use hwvtepd::{HwvtepdConfig, LoggingConfig, SeedFile, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hwvtepd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level, overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// JSON file of nodes to load into the store at startup
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Record bridge replays without writing them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match HwvtepdConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hwvtepd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Err(e) = config.validate() {
        eprintln!("hwvtepd: {}", e);
        return ExitCode::FAILURE;
    }
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("hwvtepd: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args, config).await {
        Ok(()) => {
            info!("hwvtepd: exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "hwvtepd: exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = if logging.json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to set logger: {}", e))
}

async fn run(args: Args, config: HwvtepdConfig) -> Result<()> {
    info!(
        config = %args.config.display(),
        dry_run = args.dry_run,
        "hwvtepd: starting HA engine"
    );

    let engine_config = config.engine_config();
    if let Err(e) = engine_config.selection.validate() {
        warn!(error = %e, "bridge inclusion and exclusion both set, exclusion applies");
    }

    let broker = MemoryBroker::new();
    let recorder = args
        .dry_run
        .then(|| Arc::new(RecordingTransactor::dry_run()));
    let transactor: Arc<dyn DeviceTransactor> = match &recorder {
        Some(recorder) => recorder.clone(),
        None => Arc::new(StoreTransactor),
    };

    let data_broker: Arc<dyn DataBroker> = broker.clone();
    let engine = HaEngine::start(Arc::clone(&data_broker), transactor, engine_config);

    if let Some(path) = &args.seed {
        let seed = SeedFile::load(path)?;
        if seed.is_empty() {
            warn!(seed = %path.display(), "seed file has no nodes");
        }
        seed.apply(data_broker.as_ref()).await?;
    }

    info!("hwvtepd: running, press ctrl-c to stop");
    let signal = tokio::signal::ctrl_c().await;
    if let Err(e) = &signal {
        error!(error = %e, "failed to listen for ctrl-c, shutting down");
    }
    warn!("hwvtepd: shutting down");

    for (name, stats) in engine.worker_stats() {
        info!(
            listener = %name,
            received = stats.batches_received,
            committed = stats.batches_committed,
            abandoned = stats.batches_abandoned,
            "listener totals"
        );
    }
    engine.shutdown().await;

    if let Some(recorder) = recorder {
        info!(replays = recorder.replays().len(), "dry run replays recorded");
    }
    info!(commits = broker.commit_count(), "hwvtepd: shutdown complete");

    signal.context("signal handler failed")
}
