//! Discovery, bookkeeping and job-building services

pub mod identity_scanner;
pub mod job_document;
pub mod manifest;
pub mod reconciler;
pub mod run_lock;

pub use identity_scanner::{IdentityScanner, ScanError};
pub use job_document::{
    BuiltJob, JobDocument, JobDocumentBuilder, JobError, Notification, RunTriplet,
    SettingsTemplate,
};
pub use manifest::{Manifest, ManifestError, ManifestRecord, ManifestStatus};
pub use reconciler::{Discovery, DiscoveryKind, Reconciler};
pub use run_lock::RunLock;
