//! # MRSW Common Library
//!
//! Shared code for the study pipeline crates including:
//! - Subject/session identity model and work sets
//! - Bootstrap configuration loading (TOML)
//! - Manifest timestamp formatting
//! - Common error type

pub mod config;
pub mod error;
pub mod identity;
pub mod time;

pub use error::{Error, Result};
pub use identity::{Identity, WorkSet};
