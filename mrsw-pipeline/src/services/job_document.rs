//! Analysis job document builder
//!
//! Produces the per-identity JSON job consumed by the analysis stage:
//!
//! 1. Resolve the session directory (subject directory when no session level exists)
//! 2. Find the anatomical reference (`{session_dir}/anat/{anat_pattern}`, first lexically)
//! 3. Resolve the spectroscopy directory (`mrs`, else `extra_data`)
//! 4. Glob the template's `prerequisites.files` / `prerequisites.files_ref` patterns
//! 5. Pair scan `i` with reference `i` after sorting each list independently
//! 6. Emit template settings + file lists + output folder + notification fields
//!
//! Pairing is positional, not content matched. Differing scan and reference
//! counts are rejected instead of truncated.

use crate::layout::{path_string, StudyLayout};
use mrsw_common::Identity;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Keys the builder owns; template values under these names are dropped
const RESERVED_KEYS: [&str; 7] = [
    "prerequisites",
    "files",
    "files_ref",
    "files_nii",
    "outputFolder",
    "mailtoConfig",
    "mailtoRecipients",
];

/// Job document errors (identity scoped)
#[derive(Debug, Error)]
pub enum JobError {
    /// No anatomical image for the identity
    #[error("No anatomical image matching '{pattern}' in {dir}")]
    NoAnatomicalImage { dir: PathBuf, pattern: String },

    /// Scan and reference globs matched different numbers of files
    #[error("{scans} scan file(s) but {refs} reference file(s) in {dir}")]
    ScanRefCountMismatch {
        dir: PathBuf,
        scans: usize,
        refs: usize,
    },

    /// Glob pattern could not be compiled
    #[error("Invalid pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    /// Settings template unreadable or missing required keys
    #[error("Settings template {path}: {reason}")]
    Template { path: PathBuf, reason: String },

    /// Notification config unreadable or missing required keys
    #[error("Notification config {path}: {reason}")]
    Notification { path: PathBuf, reason: String },

    /// Filesystem error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        JobError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Glob patterns the template uses to select input files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisites {
    pub files: String,
    pub files_ref: String,
}

/// Analysis settings template
///
/// `settings` holds every top-level key other than `prerequisites`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsTemplate {
    pub prerequisites: Prerequisites,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl SettingsTemplate {
    pub fn from_json_str(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Read the template file (read-only)
    pub fn load(path: &Path) -> Result<Self, JobError> {
        let content = std::fs::read_to_string(path).map_err(|e| JobError::io(path, e))?;
        Self::from_json_str(&content).map_err(|e| JobError::Template {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct NotificationFile {
    #[serde(rename = "SourceEmail")]
    source_email: String,
}

/// Notification fields written into every job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub config_path: PathBuf,
    pub recipients: Vec<String>,
}

impl Notification {
    /// Read the notification config; its source address becomes the recipient
    pub fn load(path: &Path) -> Result<Self, JobError> {
        let content = std::fs::read_to_string(path).map_err(|e| JobError::io(path, e))?;
        let file: NotificationFile =
            serde_json::from_str(&content).map_err(|e| JobError::Notification {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            config_path: path.to_path_buf(),
            recipients: vec![file.source_email],
        })
    }
}

/// Serialized job document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDocument {
    #[serde(flatten)]
    pub settings: Map<String, Value>,
    pub files: Vec<String>,
    pub files_ref: Vec<String>,
    pub files_nii: Vec<String>,
    #[serde(rename = "outputFolder")]
    pub output_folder: Vec<String>,
    #[serde(rename = "mailtoConfig")]
    pub mailto_config: String,
    #[serde(rename = "mailtoRecipients")]
    pub mailto_recipients: Vec<String>,
}

impl JobDocument {
    /// Render with four-space indentation
    pub fn to_json_pretty(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        Ok(out)
    }
}

/// One paired acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTriplet {
    pub scan: String,
    pub reference: String,
    /// Metadata sidecar path; existence is not checked
    pub sidecar: String,
}

/// Built job and where it belongs
#[derive(Debug, Clone)]
pub struct BuiltJob {
    pub document: JobDocument,
    pub runs: Vec<RunTriplet>,
    pub output_dir: PathBuf,
    pub path: PathBuf,
}

/// Builds job documents against a study layout
pub struct JobDocumentBuilder<'a> {
    layout: &'a StudyLayout,
}

impl<'a> JobDocumentBuilder<'a> {
    pub fn new(layout: &'a StudyLayout) -> Self {
        Self { layout }
    }

    /// Build the job for one identity without touching the filesystem
    pub fn build(
        &self,
        identity: &Identity,
        template: &SettingsTemplate,
        notification: &Notification,
    ) -> Result<BuiltJob, JobError> {
        let session_dir = self.layout.session_dir(identity);

        let anat_dir = session_dir.join("anat");
        let anat_pattern = &self.layout.job_config().anat_pattern;
        let anat = matching_files(&anat_dir, anat_pattern)?
            .into_iter()
            .next()
            .ok_or_else(|| JobError::NoAnatomicalImage {
                dir: anat_dir.clone(),
                pattern: anat_pattern.clone(),
            })?;

        let spectroscopy_dir = self.layout.spectroscopy_dir(&session_dir);
        let scans = matching_files(&spectroscopy_dir, &template.prerequisites.files)?;
        let refs = matching_files(&spectroscopy_dir, &template.prerequisites.files_ref)?;

        if scans.len() != refs.len() {
            return Err(JobError::ScanRefCountMismatch {
                dir: spectroscopy_dir,
                scans: scans.len(),
                refs: refs.len(),
            });
        }
        if scans.is_empty() {
            tracing::warn!(
                identity = %identity,
                dir = %spectroscopy_dir.display(),
                "No scan files matched, job will list no runs"
            );
        }

        let runs = pair_runs(&scans, &refs);
        for (index, run) in runs.iter().enumerate() {
            tracing::info!(
                identity = %identity,
                run = index + 1,
                scan = %file_name(&run.scan),
                reference = %file_name(&run.reference),
                sidecar = %file_name(&run.sidecar),
                "Paired run"
            );
        }

        let output_dir = self.layout.output_dir(identity);
        let mut settings = template.settings.clone();
        for key in RESERVED_KEYS {
            settings.remove(key);
        }

        let document = JobDocument {
            settings,
            files: runs.iter().map(|r| r.scan.clone()).collect(),
            files_ref: runs.iter().map(|r| r.reference.clone()).collect(),
            files_nii: vec![path_string(&anat)],
            output_folder: vec![path_string(&output_dir)],
            mailto_config: path_string(&notification.config_path),
            mailto_recipients: notification.recipients.clone(),
        };

        Ok(BuiltJob {
            document,
            runs,
            output_dir,
            path: self.layout.job_file(identity),
        })
    }

    /// Create the output directory and write the job file, replacing any previous one
    pub fn write(&self, job: &BuiltJob) -> Result<(), JobError> {
        std::fs::create_dir_all(&job.output_dir).map_err(|e| JobError::io(&job.output_dir, e))?;

        let parent = job
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent).map_err(|e| JobError::io(&parent, e))?;

        let bytes = job.document.to_json_pretty()?;
        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| JobError::io(&parent, e))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| JobError::io(&job.path, e))?;
        tmp.persist(&job.path)
            .map_err(|e| JobError::io(&job.path, e.error))?;
        Ok(())
    }
}

/// Sorted, de-duplicated matches of `pattern` inside `dir`
pub fn matching_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, JobError> {
    let full = format!("{}/{}", glob::Pattern::escape(&path_string(dir)), pattern);
    let paths = glob::glob(&full).map_err(|e| JobError::Pattern {
        pattern: full.clone(),
        reason: e.to_string(),
    })?;

    let mut found = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => found.push(path),
            Err(e) => {
                let path = e.path().to_path_buf();
                return Err(JobError::io(&path, e.into()));
            }
        }
    }

    found.sort();
    found.dedup();
    Ok(found)
}

/// Pair equally long scan/reference lists by position
pub fn pair_runs(scans: &[PathBuf], refs: &[PathBuf]) -> Vec<RunTriplet> {
    scans
        .iter()
        .zip(refs)
        .map(|(scan, reference)| {
            let scan = path_string(scan);
            RunTriplet {
                sidecar: sidecar_path(&scan),
                scan,
                reference: path_string(reference),
            }
        })
        .collect()
}

/// Swap an imaging extension for `.json`
pub fn sidecar_path(scan: &str) -> String {
    for ext in [".nii.gz", ".nii"] {
        if let Some(stem) = scan.strip_suffix(ext) {
            return format!("{}.json", stem);
        }
    }
    path_string(&Path::new(scan).with_extension("json"))
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
