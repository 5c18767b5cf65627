//! Stage abstraction
//!
//! A stage is one named unit of per-identity work. It either invokes one
//! external process or writes one artifact, logs what it resolved and how it
//! ended, and reports success as a plain `bool`. Errors never cross the
//! stage boundary.

use crate::layout::StudyLayout;
use async_trait::async_trait;
use mrsw_common::Identity;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// State shared by every stage of a run
#[derive(Debug, Clone)]
pub struct SharedContext {
    pub layout: StudyLayout,
    /// Installation directory of the analysis tool
    pub tool_dir: PathBuf,
    /// Log resolved commands without executing anything
    pub dry_run: bool,
    /// Tripped on shutdown signals; running children are killed
    pub cancel: CancellationToken,
}

impl SharedContext {
    pub fn root(&self) -> &Path {
        self.layout.root()
    }
}

/// Per-invocation context handed to a stage
pub struct StageContext<'a> {
    pub shared: &'a SharedContext,
    pub identity: &'a Identity,
    /// Span carrying the identity fields; stages log inside it
    pub span: &'a tracing::Span,
}

/// Stage trait - every entry of the stage chain implements this
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name as used in `stages.order` and in logs
    fn name(&self) -> &str;

    /// Run the stage for one identity
    ///
    /// # Returns
    /// * `true` - stage completed, later stages may run
    /// * `false` - stage failed; the identity's remaining stages are skipped
    async fn execute(&self, ctx: &StageContext<'_>) -> bool;
}
