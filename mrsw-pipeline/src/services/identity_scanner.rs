//! Subject/session identity scanner
//!
//! Enumerates `{raw}/{subject}/{session}` directories. Only directories
//! whose names start with the configured prefixes count. A subject without
//! any session directory yields exactly one identity carrying the default
//! session label.
//!
//! An unreadable subject directory is a discovery failure, never "no sessions".

use mrsw_common::config::DiscoveryConfig;
use mrsw_common::identity::terminal_label;
use mrsw_common::Identity;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Identity scanner errors (all fatal for the run)
#[derive(Debug, Error)]
pub enum ScanError {
    /// Specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Path exists but is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Directory listing failed
    #[error("Cannot read directory {0}: {1}")]
    Unreadable(PathBuf, String),

    /// Directory name cannot serve as a label
    #[error("Invalid label for {0}: {1}")]
    InvalidLabel(PathBuf, String),
}

/// Identity scanner
#[derive(Debug, Clone)]
pub struct IdentityScanner {
    subject_prefix: String,
    session_prefix: String,
    default_session: String,
}

impl IdentityScanner {
    /// Create scanner from discovery conventions
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            subject_prefix: config.subject_prefix.clone(),
            session_prefix: config.session_prefix.clone(),
            default_session: config.default_session.clone(),
        }
    }

    /// Build the current universe of identities under `raw_dir`
    pub fn scan(&self, raw_dir: &Path) -> Result<BTreeSet<Identity>, ScanError> {
        let mut universe = BTreeSet::new();

        for subject_dir in self.list_prefixed_dirs(raw_dir, &self.subject_prefix)? {
            let subject = label_of(&subject_dir)?;
            let sessions = self.list_prefixed_dirs(&subject_dir, &self.session_prefix)?;

            if sessions.is_empty() {
                tracing::debug!(
                    subject = %subject,
                    "No session directories, using default session"
                );
                universe.insert(identity(&subject_dir, &subject, &self.default_session)?);
                continue;
            }

            for session_dir in sessions {
                let session = label_of(&session_dir)?;
                universe.insert(identity(&session_dir, &subject, &session)?);
            }
        }

        tracing::debug!(
            raw_dir = %raw_dir.display(),
            identities = universe.len(),
            "Identity scan complete"
        );

        Ok(universe)
    }

    /// Immediate child directories whose names start with `prefix`, sorted
    fn list_prefixed_dirs(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, ScanError> {
        if !dir.exists() {
            return Err(ScanError::PathNotFound(dir.to_path_buf()));
        }
        if !dir.is_dir() {
            return Err(ScanError::NotADirectory(dir.to_path_buf()));
        }

        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();

        let mut found = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                ScanError::Unreadable(path, e.to_string())
            })?;

            if !entry.file_type().is_dir() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(prefix) {
                found.push(entry.into_path());
            }
        }

        found.dedup();
        Ok(found)
    }
}

fn label_of(path: &Path) -> Result<String, ScanError> {
    terminal_label(&path.to_string_lossy())
        .ok_or_else(|| ScanError::InvalidLabel(path.to_path_buf(), "empty name".to_string()))
}

fn identity(path: &Path, subject: &str, session: &str) -> Result<Identity, ScanError> {
    Identity::new(subject, session)
        .map_err(|e| ScanError::InvalidLabel(path.to_path_buf(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scanner() -> IdentityScanner {
        IdentityScanner::new(&DiscoveryConfig::default())
    }

    fn labels(universe: &BTreeSet<Identity>) -> Vec<String> {
        universe.iter().map(Identity::combined_key).collect()
    }

    #[test]
    fn test_scan_nonexistent_path() {
        let result = scanner().scan(Path::new("/nonexistent/raw"));
        match result {
            Err(ScanError::PathNotFound(_)) => {}
            other => panic!("Expected PathNotFound error, got {:?}", other),
        }
    }

    #[test]
    fn test_scan_file_as_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("raw");
        fs::write(&file, b"not a dir").unwrap();

        match scanner().scan(&file) {
            Err(ScanError::NotADirectory(_)) => {}
            other => panic!("Expected NotADirectory error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_subject_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let subject = temp.path().join("sub-01");
        fs::create_dir_all(subject.join("ses-01")).unwrap();
        fs::set_permissions(&subject, fs::Permissions::from_mode(0o000)).unwrap();

        // Permission bits do not bind root
        let bypassed = fs::read_dir(&subject).is_ok();
        let result = scanner().scan(temp.path());
        fs::set_permissions(&subject, fs::Permissions::from_mode(0o755)).unwrap();
        if bypassed {
            return;
        }

        match result {
            Err(ScanError::Unreadable(path, _)) => assert!(path.starts_with(&subject)),
            other => panic!("Expected Unreadable error, got {:?}", other),
        }
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp = TempDir::new().unwrap();
        assert!(scanner().scan(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_subject_without_sessions_gets_default() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("sub-02")).unwrap();

        let universe = scanner().scan(temp.path()).unwrap();
        assert_eq!(labels(&universe), vec!["sub-02_ses-01"]);
    }

    #[test]
    fn test_subject_with_two_sessions() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("sub-01/ses-02")).unwrap();
        fs::create_dir_all(temp.path().join("sub-01/ses-01")).unwrap();

        let universe = scanner().scan(temp.path()).unwrap();
        assert_eq!(labels(&universe), vec!["sub-01_ses-01", "sub-01_ses-02"]);
    }

    #[test]
    fn test_ignores_files_and_unprefixed_entries() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("sub-01/dicoms")).unwrap();
        fs::create_dir_all(temp.path().join("pilot")).unwrap();
        fs::write(temp.path().join("participant_log.csv"), b"").unwrap();
        fs::write(temp.path().join("sub-notes.txt"), b"").unwrap();
        fs::write(temp.path().join("sub-01/sub-01_ses-01.log"), b"").unwrap();
        fs::write(temp.path().join("sub-01/ses-readme.txt"), b"").unwrap();

        let universe = scanner().scan(temp.path()).unwrap();
        assert_eq!(labels(&universe), vec!["sub-01_ses-01"]);
    }

    #[test]
    fn test_custom_prefixes() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("P001/visit1")).unwrap();
        fs::create_dir_all(temp.path().join("P002")).unwrap();

        let config = DiscoveryConfig {
            subject_prefix: "P".to_string(),
            session_prefix: "visit".to_string(),
            default_session: "visit0".to_string(),
            process_bootstrap: true,
        };
        let universe = IdentityScanner::new(&config).scan(temp.path()).unwrap();
        assert_eq!(labels(&universe), vec!["P001_visit1", "P002_visit0"]);
    }
}
