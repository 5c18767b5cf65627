//! Participant manifest
//!
//! Append-only record of every (subject, session) ever discovered, stored
//! as CSV with columns `Date,Directory,Subject,Session`. Rows are never
//! rewritten or removed. New rows are only appended for identities not yet
//! recorded; duplicate rows left by older tooling are kept as loaded.
//!
//! Every save rewrites the whole file through a temporary file in the same
//! directory followed by a rename, so readers never observe a half-written
//! manifest. Unknown columns (such as a leading unnamed index column) are
//! ignored on load.

use chrono::NaiveDateTime;
use csv::{ReaderBuilder, WriterBuilder};
use mrsw_common::time::{format_manifest_time, parse_manifest_time};
use mrsw_common::Identity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

const HEADER: [&str; 4] = ["Date", "Directory", "Subject", "Session"];

/// Manifest errors
#[derive(Debug, Error)]
pub enum ManifestError {
    /// File exists but does not match the expected schema
    #[error("Manifest {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Reading or writing the file failed
    #[error("Manifest I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ManifestError {
    fn io(path: &Path, source: impl Into<std::io::Error>) -> Self {
        ManifestError::Io {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }

    fn corrupt(path: &Path, reason: impl ToString) -> Self {
        ManifestError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Whether the manifest file was present when loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestStatus {
    /// No file yet; the next save bootstraps it
    Missing,
    /// Loaded from disk
    Present,
}

/// One manifest row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    pub discovered_at: NaiveDateTime,
    pub root_path: String,
    pub identity: Identity,
}

/// On-disk CSV row
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Directory")]
    directory: String,
    #[serde(rename = "Subject")]
    subject: String,
    #[serde(rename = "Session")]
    session: String,
}

/// In-memory manifest bound to its file path
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    status: ManifestStatus,
    records: Vec<ManifestRecord>,
}

impl Manifest {
    /// Load the manifest at `path`
    ///
    /// A missing file is not an error: the result is empty with status
    /// [`ManifestStatus::Missing`].
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                status: ManifestStatus::Missing,
                records: Vec::new(),
            });
        }

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| csv_error(path, e))?;

        let mut records: Vec<ManifestRecord> = Vec::new();
        let mut seen = BTreeSet::new();

        for (index, row) in reader.deserialize::<CsvRow>().enumerate() {
            let line = index + 2;
            let row = row.map_err(|e| csv_error(path, e))?;

            let discovered_at = parse_manifest_time(&row.date).map_err(|e| {
                let reason = format!("line {}: bad Date '{}': {}", line, row.date, e);
                ManifestError::corrupt(path, reason)
            })?;
            let identity = Identity::new(row.subject.trim(), row.session.trim())
                .map_err(|e| ManifestError::corrupt(path, format!("line {}: {}", line, e)))?;

            // Older tooling could write an identity twice; the row stays, counted once
            if !seen.insert(identity.clone()) {
                tracing::warn!(
                    manifest = %path.display(),
                    identity = %identity,
                    line,
                    "Duplicate manifest row"
                );
            }

            records.push(ManifestRecord {
                discovered_at,
                root_path: row.directory,
                identity,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            status: ManifestStatus::Present,
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> ManifestStatus {
        self.status
    }

    pub fn records(&self) -> &[ManifestRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Recorded identities, keyed by (subject, session) value
    pub fn identities(&self) -> BTreeSet<Identity> {
        self.records.iter().map(|r| r.identity.clone()).collect()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.records.iter().any(|r| &r.identity == identity)
    }

    /// Append identities not yet recorded; returns the ones actually added
    ///
    /// Existing rows are left untouched, so the manifest only ever grows.
    pub fn append<'a, I>(
        &mut self,
        identities: I,
        root_path: &str,
        at: NaiveDateTime,
    ) -> Vec<Identity>
    where
        I: IntoIterator<Item = &'a Identity>,
    {
        let mut known = self.identities();
        let mut added = Vec::new();

        for identity in identities {
            if !known.insert(identity.clone()) {
                continue;
            }
            self.records.push(ManifestRecord {
                discovered_at: at,
                root_path: root_path.to_string(),
                identity: identity.clone(),
            });
            added.push(identity.clone());
        }

        added
    }

    /// Rewrite the whole manifest atomically
    pub fn save(&mut self) -> Result<(), ManifestError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| ManifestError::io(&parent, e))?;

        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| ManifestError::io(&parent, e))?;
        {
            let mut writer = WriterBuilder::new()
                .has_headers(false)
                .from_writer(tmp.as_file_mut());
            writer
                .write_record(HEADER)
                .map_err(|e| csv_error(&self.path, e))?;
            for record in &self.records {
                writer
                    .serialize(CsvRow {
                        date: format_manifest_time(&record.discovered_at),
                        directory: record.root_path.clone(),
                        subject: record.identity.subject.clone(),
                        session: record.identity.session.clone(),
                    })
                    .map_err(|e| csv_error(&self.path, e))?;
            }
            writer.flush().map_err(|e| ManifestError::io(&self.path, e))?;
        }
        tmp.as_file_mut()
            .flush()
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| ManifestError::io(&self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| ManifestError::io(&self.path, e.error))?;

        self.status = ManifestStatus::Present;
        tracing::debug!(
            manifest = %self.path.display(),
            rows = self.records.len(),
            "Manifest written"
        );
        Ok(())
    }
}

fn csv_error(path: &Path, err: csv::Error) -> ManifestError {
    if err.is_io_error() {
        match err.into_kind() {
            csv::ErrorKind::Io(io) => ManifestError::io(path, io),
            other => ManifestError::corrupt(path, format!("{:?}", other)),
        }
    } else {
        ManifestError::corrupt(path, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 10, 1)
            .unwrap()
            .and_hms_opt(9, 15, 0)
            .unwrap()
    }

    fn id(sub: &str, ses: &str) -> Identity {
        Identity::new(sub, ses).unwrap()
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let manifest = Manifest::load(&temp.path().join("participant_log.csv")).unwrap();
        assert_eq!(manifest.status(), ManifestStatus::Missing);
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("participant_log.csv");

        let mut manifest = Manifest::load(&path).unwrap();
        let ids = [id("sub-01", "ses-01"), id("sub-02", "ses-01")];
        manifest.append(ids.iter(), "/data/study", ts());
        manifest.save().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Date,Directory,Subject,Session\n"));
        assert!(text.contains("10/01/2022 09:15:00 AM,/data/study,sub-01,ses-01"));

        let reloaded = Manifest::load(&path).unwrap();
        assert_eq!(reloaded.status(), ManifestStatus::Present);
        assert_eq!(reloaded.records(), manifest.records());
    }

    #[test]
    fn test_append_skips_recorded_identities() {
        let temp = TempDir::new().unwrap();
        let mut manifest = Manifest::load(&temp.path().join("m.csv")).unwrap();

        let first = manifest.append([id("sub-01", "ses-01")].iter(), "/r", ts());
        assert_eq!(first.len(), 1);

        let second = manifest.append(
            [id("sub-01", "ses-01"), id("sub-01", "ses-02")].iter(),
            "/r",
            ts(),
        );
        assert_eq!(second, vec![id("sub-01", "ses-02")]);
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn test_empty_manifest_keeps_header() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("m.csv");
        let mut manifest = Manifest::load(&path).unwrap();
        manifest.save().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "Date,Directory,Subject,Session\n");
        let reloaded = Manifest::load(&path).unwrap();
        assert_eq!(reloaded.status(), ManifestStatus::Present);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_load_ignores_index_column() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("participant_log.csv");
        fs::write(
            &path,
            ",Date,Directory,Subject,Session\n\
             0,10/01/2022 09:15:00 AM,C:/data/study,sub-01,ses-01\n\
             1,10/01/2022 09:15:00 AM,C:/data/study,sub-02,ses-01\n",
        )
        .unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.records()[0].root_path, "C:/data/study");
        assert!(manifest.contains(&id("sub-02", "ses-01")));
    }

    #[test]
    fn test_duplicate_rows_survive_save() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("m.csv");
        fs::write(
            &path,
            "Date,Directory,Subject,Session\n\
             10/01/2022 09:15:00 AM,/r,sub-01,ses-01\n\
             10/02/2022 09:15:00 AM,/r,sub-01,ses-01\n",
        )
        .unwrap();

        let mut manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.identities().len(), 1);
        assert_eq!(manifest.records()[0].discovered_at, ts());

        let added = manifest.append([id("sub-01", "ses-01")].iter(), "/r", ts());
        assert!(added.is_empty());

        manifest.save().unwrap();
        let reloaded = Manifest::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.records(), manifest.records());
    }

    #[test]
    fn test_missing_column_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("m.csv");
        fs::write(&path, "Date,Directory,Subject\n10/01/2022 09:15:00 AM,/r,sub-01\n").unwrap();

        match Manifest::load(&path) {
            Err(ManifestError::Corrupt { .. }) => {}
            other => panic!("Expected Corrupt error, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_date_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("m.csv");
        fs::write(&path, "Date,Directory,Subject,Session\nyesterday,/r,sub-01,ses-01\n").unwrap();

        match Manifest::load(&path) {
            Err(ManifestError::Corrupt { reason, .. }) => assert!(reason.contains("line 2")),
            other => panic!("Expected Corrupt error, got {:?}", other),
        }
    }
}
