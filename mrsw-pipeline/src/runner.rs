//! One complete orchestrator run against a study root
//!
//! Stage chain assembly, lock, discovery, settling delay, then the pipeline.
//! Everything before the pipeline is run-scoped: any error aborts the run
//! before a single stage executes.

use crate::error::RunResult;
use crate::layout::StudyLayout;
use crate::pipeline::{build_stage_chain, RunSummary, SharedContext, StagePipeline};
use crate::services::{Discovery, DiscoveryKind, IdentityScanner, Reconciler, RunLock};
use mrsw_common::config::TomlConfig;
use mrsw_common::WorkSet;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per-invocation inputs
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub root: PathBuf,
    pub tool_dir: PathBuf,
    pub dry_run: bool,
}

/// What a run discovered and how each identity ended
#[derive(Debug)]
pub struct RunReport {
    pub discovery: Discovery,
    pub work_set: WorkSet,
    pub summary: RunSummary,
}

/// Execute one run
pub async fn run_study(
    config: &TomlConfig,
    options: RunOptions,
    cancel: CancellationToken,
) -> RunResult<RunReport> {
    let layout = StudyLayout::new(&options.root, config);
    let stages = build_stage_chain(&config.stages)?;

    // A missing raw tree is reported by discovery, not by the lock
    let _lock = if layout.raw_dir().is_dir() {
        Some(RunLock::acquire(&layout.lock_file())?)
    } else {
        None
    };

    let reconciler = Reconciler::new(IdentityScanner::new(&config.discovery));
    let discovery = if options.dry_run {
        reconciler.preview(layout.root(), layout.manifest_file())?
    } else {
        reconciler.discover(layout.root(), layout.manifest_file())?
    };

    let record_only =
        discovery.kind == DiscoveryKind::Bootstrap && !config.discovery.process_bootstrap;
    let work_set = if record_only {
        info!(
            identities = discovery.identities.len(),
            "Bootstrap recorded only; existing identities will not be processed"
        );
        WorkSet::new()
    } else {
        WorkSet::from(&discovery.identities)
    };

    if work_set.is_empty() {
        info!("No new identities, nothing to process");
    } else if options.dry_run {
        info!("Dry run, skipping settle delay");
    } else {
        let delay = config.settle.delay_for(work_set.subject_count());
        info!(
            subjects = work_set.subject_count(),
            delay_secs = delay.as_secs(),
            "Waiting for transfers to settle"
        );
        tokio::time::sleep(delay).await;
        if cancel.is_cancelled() {
            warn!("Shutdown requested during settle delay");
        }
    }

    let shared = SharedContext {
        layout,
        tool_dir: options.tool_dir,
        dry_run: options.dry_run,
        cancel,
    };
    let summary = StagePipeline::new(stages).run(&work_set, &shared).await;

    for outcome in summary.outcomes.iter().filter(|o| !o.succeeded()) {
        warn!(
            identity = %outcome.identity,
            state = ?outcome.state,
            failed_stage = outcome.failed_stage.as_deref().unwrap_or("-"),
            skipped = ?outcome.skipped,
            "Identity did not complete"
        );
    }

    Ok(RunReport {
        discovery,
        work_set,
        summary,
    })
}
