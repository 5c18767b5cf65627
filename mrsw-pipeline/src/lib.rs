//! mrsw-pipeline library interface
//!
//! Exposes discovery, manifest and pipeline APIs for the binary and for
//! integration testing.

pub mod error;
pub mod identity_log;
pub mod layout;
pub mod pipeline;
pub mod runner;
pub mod services;

pub use crate::error::{RunError, RunResult};
pub use crate::identity_log::IdentityLogLayer;
pub use crate::layout::StudyLayout;
pub use crate::runner::{run_study, RunOptions, RunReport};
