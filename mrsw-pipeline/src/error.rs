//! Run-scoped error type for mrsw-pipeline
//!
//! Only errors that abort a whole run live here. Identity-scoped failures
//! (missing anatomical image, tool exit status, timeouts) stop at the stage
//! boundary and are reported as a failed stage instead.

use crate::services::identity_scanner::ScanError;
use crate::services::manifest::ManifestError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for run-scoped operations
pub type RunResult<T> = std::result::Result<T, RunError>;

/// Errors that abort the run before any stage work
#[derive(Debug, Error)]
pub enum RunError {
    /// Raw-data tree unreadable or missing
    #[error("Discovery failed: {0}")]
    Discovery(#[from] ScanError),

    /// Manifest exists but cannot be used
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Another run holds the study lock
    #[error("Another run holds the lock {0}")]
    Locked(PathBuf),

    /// Stage chain names an unknown stage
    #[error("Unknown stage '{0}' in stage order")]
    UnknownStage(String),

    /// mrsw-common error
    #[error("Common error: {0}")]
    Common(#[from] mrsw_common::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
