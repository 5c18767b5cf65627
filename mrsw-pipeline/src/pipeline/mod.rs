//! Per-identity stage pipeline
//!
//! Identities run one after another: subjects lexically, sessions in discovery order.
//! Each identity starts from a fresh state:
//!
//! ```text
//! Pending -> Running(stage) -> Succeeded
//!                          \-> Failed(stage)   remaining stages skipped
//! Pending -> Cancelled                         shutdown requested before start
//! ```
//!
//! A failure never carries over to the next identity.

pub mod command;
pub mod stage;
pub mod stages;

pub use command::{CommandStage, StageExecutionError};
pub use stage::{SharedContext, Stage, StageContext};
pub use stages::{build_stage_chain, JobGenerationStage};

use crate::identity_log::IDENTITY_SPAN;
use mrsw_common::{Identity, WorkSet};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Lifecycle of one identity within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Pending,
    /// Executing the stage at this index
    Running(usize),
    Succeeded,
    /// Stage at this index returned failure
    Failed(usize),
    Cancelled,
}

impl IdentityState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IdentityState::Succeeded | IdentityState::Failed(_) | IdentityState::Cancelled
        )
    }
}

/// How one identity's stage chain ended
#[derive(Debug, Clone)]
pub struct IdentityOutcome {
    pub identity: Identity,
    pub state: IdentityState,
    /// Stages that ran, in order
    pub executed: Vec<String>,
    /// Stages skipped after a failure or cancellation
    pub skipped: Vec<String>,
    /// Name of the failing stage, if any
    pub failed_stage: Option<String>,
}

impl IdentityOutcome {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            state: IdentityState::Pending,
            executed: Vec::new(),
            skipped: Vec::new(),
            failed_stage: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == IdentityState::Succeeded
    }
}

/// Result of a whole pipeline run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcomes: Vec<IdentityOutcome>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.count(|s| *s == IdentityState::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, IdentityState::Failed(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|s| *s == IdentityState::Cancelled)
    }

    pub fn outcome(&self, identity: &Identity) -> Option<&IdentityOutcome> {
        self.outcomes.iter().find(|o| &o.identity == identity)
    }

    fn count(&self, predicate: impl Fn(&IdentityState) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.state)).count()
    }
}

/// Ordered stage chain applied to every identity of a work set
pub struct StagePipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl StagePipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every identity of the work set through the chain
    pub async fn run(&self, work_set: &WorkSet, shared: &SharedContext) -> RunSummary {
        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            subjects = work_set.subject_count(),
            identities = work_set.identity_count(),
            stages = ?self.stage_names(),
            "Pipeline starting"
        );

        let mut outcomes = Vec::with_capacity(work_set.identity_count());
        for identity in work_set.identities() {
            let outcome = self.run_identity(identity, shared).await;
            outcomes.push(outcome);
        }

        let summary = RunSummary { run_id, outcomes };
        info!(
            run_id = %run_id,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            cancelled = summary.cancelled(),
            "Pipeline finished"
        );
        summary
    }

    async fn run_identity(&self, identity: Identity, shared: &SharedContext) -> IdentityOutcome {
        let span = info_span!(
            IDENTITY_SPAN,
            subject = %identity.subject,
            session = %identity.session
        );
        let mut outcome = IdentityOutcome::new(identity);

        if shared.cancel.is_cancelled() {
            outcome.state = IdentityState::Cancelled;
            outcome.skipped = self.stages.iter().map(|s| s.name().to_string()).collect();
            span.in_scope(|| warn!("Shutdown requested, identity not started"));
            return outcome;
        }

        span.in_scope(|| info!("Processing identity"));

        for (index, stage) in self.stages.iter().enumerate() {
            if outcome.state.is_terminal() {
                span.in_scope(|| info!(stage = stage.name(), "Skipped"));
                outcome.skipped.push(stage.name().to_string());
                continue;
            }

            outcome.state = IdentityState::Running(index);
            let ctx = StageContext {
                shared,
                identity: &outcome.identity,
                span: &span,
            };
            let ok = stage.execute(&ctx).instrument(span.clone()).await;
            outcome.executed.push(stage.name().to_string());

            if !ok {
                outcome.state = IdentityState::Failed(index);
                outcome.failed_stage = Some(stage.name().to_string());
            }
        }

        if !outcome.state.is_terminal() {
            outcome.state = IdentityState::Succeeded;
        }

        span.in_scope(|| match &outcome.failed_stage {
            None => info!(success = true, "Identity complete"),
            Some(stage) => warn!(success = false, failed_stage = %stage, "Identity failed"),
        });
        outcome
    }
}
