//! reconcilerd entry point.
//!
//! Loads the configuration, opens the tracking store, starts the manifest
//! producer and runs the installer loop until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use reconciler_core::{Installer, ProcessorRegistry};
use reconcilerd::{ConfigFileProcessor, DaemonConfig, ManifestProducer, ModuleFileProcessor};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Reconciling resource installer
#[derive(Parser, Debug)]
#[command(name = "reconcilerd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Daemon configuration file (TOML)
    #[arg(short = 'c', long, default_value = "/etc/reconciler/reconcilerd.toml")]
    config: PathBuf,

    /// Manifest to watch, overriding the configuration
    #[arg(short = 'm', long)]
    manifest: Option<PathBuf>,

    /// Tracking store directory, overriding the configuration
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Runtime directory for installed files, overriding the configuration
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Register the manifest, reconcile, run until idle and exit
    #[arg(long)]
    once: bool,
}

impl Args {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(manifest) = &self.manifest {
            config.manifest_path = Some(manifest.clone());
        }
        if let Some(state_dir) = &self.state_dir {
            config.installer.state_dir = state_dir.clone();
        }
        if let Some(runtime_dir) = &self.runtime_dir {
            config.runtime_dir = runtime_dir.clone();
        }
    }
}

/// Upper bound on passes in `--once` mode.
const ONCE_MAX_PASSES: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("--- Starting reconcilerd ---");
    match run(args).await {
        Ok(()) => {
            info!("reconcilerd exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("reconcilerd failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = DaemonConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut config);
    info!("State directory: {}", config.installer.state_dir.display());
    info!("Runtime directory: {}", config.runtime_dir.display());

    let processors = ProcessorRegistry::new()
        .with(Arc::new(ModuleFileProcessor::new(&config.runtime_dir)))
        .with(Arc::new(ConfigFileProcessor::new(&config.runtime_dir)));
    let installer = Arc::new(
        Installer::open(config.installer.clone(), processors)
            .context("opening installer")?
            .with_rules(config.override_rules.clone()),
    );

    let producer = config
        .manifest_path
        .as_ref()
        .map(|path| ManifestProducer::new(path, Arc::clone(&installer)));
    if producer.is_none() {
        warn!("No manifest configured; only previously tracked entities are reconciled");
    }

    if args.once {
        return run_once(&installer, producer).await;
    }

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    if let Some(producer) = producer {
        tasks.push(tokio::spawn(
            producer.run(config.poll_interval(), shutdown.clone()),
        ));
    }
    {
        let installer = Arc::clone(&installer);
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move { installer.run(token).await }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received SIGINT, shutting down");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }

    let stats = installer.stats();
    info!(
        "Final stats: {} installed, {} updated, {} uninstalled, {} failed",
        stats.installed, stats.updated, stats.uninstalled, stats.failed
    );
    Ok(())
}

/// The manifest is the only producer, so once it has registered every
/// tracked entity it does not declare is an orphan.
async fn run_once(installer: &Installer, producer: Option<ManifestProducer>) -> anyhow::Result<()> {
    if let Some(mut producer) = producer {
        producer
            .poll()
            .with_context(|| format!("registering {}", producer.path().display()))?;
    }
    installer.reconcile_unconfirmed();

    let passes = installer.run_until_idle(ONCE_MAX_PASSES).await;
    let stats = installer.stats();
    info!(
        "{} passes: {} installed, {} updated, {} uninstalled, {} skipped, {} failed",
        passes.len(),
        stats.installed,
        stats.updated,
        stats.uninstalled,
        stats.skipped,
        stats.failed
    );

    if installer.has_pending_tasks() {
        warn!(
            "Tasks still pending at exit: {:?}",
            installer.dump_pending_tasks()
        );
    }
    if stats.failed > 0 {
        anyhow::bail!("{} tasks failed permanently", stats.failed);
    }
    Ok(())
}
