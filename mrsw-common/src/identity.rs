//! Subject/session identities and per-run work sets
//!
//! An identity is the (subject, session) pair a study processes as one unit.
//! Labels are always the terminal component of a directory path, taken after
//! separators have been normalized to `/`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Session label used when a subject has no session sub-structure
pub const DEFAULT_SESSION: &str = "ses-01";

/// One (subject, session) pair
///
/// Ordering is lexical by subject, then session, which is also the order
/// directory scans produce.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    pub session: String,
}

impl Identity {
    /// Build an identity from two labels
    ///
    /// Labels must be non-empty and must not contain a path separator.
    pub fn new(subject: impl Into<String>, session: impl Into<String>) -> Result<Self> {
        let subject = subject.into();
        let session = session.into();
        validate_label("subject", &subject)?;
        validate_label("session", &session)?;
        Ok(Self { subject, session })
    }

    /// Combined `{subject}_{session}` key used for log file names and job files
    pub fn combined_key(&self) -> String {
        format!("{}_{}", self.subject, self.session)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.subject, self.session)
    }
}

fn validate_label(kind: &str, label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::InvalidInput(format!("empty {} label", kind)));
    }
    if label.contains('/') || label.contains('\\') {
        return Err(Error::InvalidInput(format!(
            "{} label contains a path separator: {}",
            kind, label
        )));
    }
    Ok(())
}

/// Replace platform-specific separators with `/`
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Terminal component of a path after separator normalization
///
/// Trailing separators are ignored, so `"raw/sub-01/"` yields `"sub-01"`.
pub fn terminal_label(path: &str) -> Option<String> {
    normalize_separators(path)
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}

/// Ordered mapping of subject to its sessions
///
/// Subjects iterate lexically; sessions keep insertion order and are never
/// duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSet {
    subjects: BTreeMap<String, Vec<String>>,
}

impl WorkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity; returns false if it was already present
    pub fn insert(&mut self, identity: Identity) -> bool {
        let sessions = self.subjects.entry(identity.subject).or_default();
        if sessions.contains(&identity.session) {
            return false;
        }
        sessions.push(identity.session);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Number of distinct subjects
    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    /// Number of (subject, session) pairs
    pub fn identity_count(&self) -> usize {
        self.subjects.values().map(Vec::len).sum()
    }

    /// Sessions recorded for one subject
    pub fn sessions(&self, subject: &str) -> Option<&[String]> {
        self.subjects.get(subject).map(Vec::as_slice)
    }

    /// Iterate identities subject by subject, sessions in insertion order
    pub fn identities(&self) -> impl Iterator<Item = Identity> + '_ {
        self.subjects.iter().flat_map(|(subject, sessions)| {
            sessions.iter().map(move |session| Identity {
                subject: subject.clone(),
                session: session.clone(),
            })
        })
    }
}

impl FromIterator<Identity> for WorkSet {
    fn from_iter<I: IntoIterator<Item = Identity>>(iter: I) -> Self {
        let mut set = WorkSet::new();
        for identity in iter {
            set.insert(identity);
        }
        set
    }
}

impl From<&BTreeSet<Identity>> for WorkSet {
    fn from(identities: &BTreeSet<Identity>) -> Self {
        identities.iter().cloned().collect()
    }
}
