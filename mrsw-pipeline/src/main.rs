//! Spectroscopy pipeline orchestrator (mrsw-pipeline) - Main entry point
//!
//! One invocation: discover new subject/session identities under
//! `{root}/raw`, record them in the participant manifest, wait for transfers
//! to settle, then run sorting, conversion, job generation and analysis for
//! each identity in turn.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use mrsw_common::config::{load_config_with_source, LoggingConfig};
use mrsw_pipeline::{run_study, IdentityLogLayer, RunOptions, StudyLayout};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for mrsw-pipeline
#[derive(Parser, Debug)]
#[command(name = "mrsw-pipeline")]
#[command(about = "Spectroscopy study pipeline orchestrator")]
#[command(version)]
struct Args {
    /// Study root folder containing raw/ and bids/
    #[arg(short = 'b', long = "base", env = "MRSW_ROOT_FOLDER")]
    base: PathBuf,

    /// Analysis tool installation directory
    #[arg(short = 'o', long = "tool-dir", visible_alias = "osprey", env = "MRSW_TOOL_DIR")]
    tool_dir: PathBuf,

    /// Configuration file (overrides MRSW_CONFIG and the per-user config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log resolved commands without executing stages or updating the manifest
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logged once the subscriber exists; the level comes from this config
    let (config, config_source) = load_config_with_source(args.config.as_deref())
        .context("Failed to load configuration")?;

    let layout = StudyLayout::new(&args.base, &config);
    let log_target = log_file_path(&config.logging, &layout);
    let (log_file, log_file_error) = match log_target.as_deref().map(open_log_file) {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let file_layer = log_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });
    let identity_layer = config
        .logging
        .identity_log
        .then(|| IdentityLogLayer::new(layout.clone()));

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .with(identity_layer)
        .init();

    config_source.log();

    if let (Some(path), Some(e)) = (&log_target, &log_file_error) {
        warn!("Study log {} unavailable: {}", path.display(), e);
    }

    info!(
        "Starting mrsw-pipeline v{} for study '{}'",
        env!("CARGO_PKG_VERSION"),
        layout.study_name()
    );
    info!("Study root: {}", layout.root().display());
    info!("Tool directory: {}", args.tool_dir.display());
    if args.dry_run {
        info!("Dry run: no tools will be executed and the manifest will not be updated");
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let options = RunOptions {
        root: args.base.clone(),
        tool_dir: args.tool_dir.clone(),
        dry_run: args.dry_run,
    };

    let report = match run_study(&config, options, cancel).await {
        Ok(report) => report,
        Err(e) => {
            error!("Run aborted: {}", e);
            return Err(e).context("Run aborted before stage execution");
        }
    };

    info!(
        "Run {} complete: {} new identities ({:?}), {} succeeded, {} failed, {} cancelled",
        report.summary.run_id,
        report.discovery.identities.len(),
        report.discovery.kind,
        report.summary.succeeded(),
        report.summary.failed(),
        report.summary.cancelled()
    );

    Ok(())
}

/// Where the study log goes, if anywhere
fn log_file_path(logging: &LoggingConfig, layout: &StudyLayout) -> Option<PathBuf> {
    match &logging.file {
        Some(path) => Some(path.clone()),
        None if logging.study_log => Some(layout.study_log_file()),
        None => None,
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, cancelling run");
        },
        _ = terminate => {
            warn!("Received terminate signal, cancelling run");
        },
    }
}
