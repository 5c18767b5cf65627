//! Built-in stages and stage chain assembly

use super::command::{CommandStage, StageExecutionError};
use super::stage::{Stage, StageContext};
use crate::error::{RunError, RunResult};
use crate::services::job_document::{JobDocumentBuilder, Notification, SettingsTemplate};
use async_trait::async_trait;
use mrsw_common::config::StagesConfig;
use tracing::{error, info};

pub const DICOMSORT_STAGE: &str = "dicomsort";
pub const BIDSCOIN_STAGE: &str = "bidscoin";
pub const JOB_STAGE: &str = "job";
pub const ANALYSIS_STAGE: &str = "analysis";

/// Writes the per-identity analysis job document
pub struct JobGenerationStage;

impl JobGenerationStage {
    fn generate(&self, ctx: &StageContext<'_>) -> Result<std::path::PathBuf, StageExecutionError> {
        let layout = &ctx.shared.layout;
        let builder = JobDocumentBuilder::new(layout);
        let job_path = layout.job_file(ctx.identity);
        let artifact = |reason: String| StageExecutionError::Artifact {
            path: job_path.clone(),
            reason,
        };

        let template = SettingsTemplate::load(layout.settings_template())
            .map_err(|e| artifact(e.to_string()))?;
        let notification = Notification::load(layout.notification_config())
            .map_err(|e| artifact(e.to_string()))?;

        let job = builder
            .build(ctx.identity, &template, &notification)
            .map_err(|e| artifact(e.to_string()))?;

        if ctx.shared.dry_run {
            info!(
                stage = JOB_STAGE,
                job = %job.path.display(),
                runs = job.runs.len(),
                "Dry run (job not written)"
            );
            return Ok(job.path);
        }

        builder.write(&job).map_err(|e| artifact(e.to_string()))?;
        Ok(job.path)
    }
}

#[async_trait]
impl Stage for JobGenerationStage {
    fn name(&self) -> &str {
        JOB_STAGE
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> bool {
        info!(stage = JOB_STAGE, "Starting");
        match self.generate(ctx) {
            Ok(path) => {
                info!(stage = JOB_STAGE, job = %path.display(), success = true, "Finished");
                true
            }
            Err(e) => {
                error!(stage = JOB_STAGE, error = %e, success = false, "Stage failed");
                false
            }
        }
    }
}

/// Build the configured stage chain in order
pub fn build_stage_chain(config: &StagesConfig) -> RunResult<Vec<Box<dyn Stage>>> {
    config
        .order
        .iter()
        .map(|name| -> RunResult<Box<dyn Stage>> {
            match name.as_str() {
                DICOMSORT_STAGE => Ok(Box::new(CommandStage::new(
                    DICOMSORT_STAGE,
                    config.dicomsort.clone(),
                ))),
                BIDSCOIN_STAGE => Ok(Box::new(CommandStage::new(
                    BIDSCOIN_STAGE,
                    config.bidscoin.clone(),
                ))),
                JOB_STAGE => Ok(Box::new(JobGenerationStage)),
                ANALYSIS_STAGE => Ok(Box::new(CommandStage::new(
                    ANALYSIS_STAGE,
                    config.analysis.clone(),
                ))),
                other => Err(RunError::UnknownStage(other.to_string())),
            }
        })
        .collect()
}
