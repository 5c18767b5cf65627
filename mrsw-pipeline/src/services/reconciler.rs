//! Manifest reconciliation
//!
//! Diffs the identities currently on disk against the manifest and records
//! the difference. Comparison is by (subject, session) value only; stored
//! timestamps and root paths play no part.
//!
//! Calling [`Reconciler::reconcile`] twice with no filesystem change in
//! between returns an empty set the second time.

use crate::error::RunResult;
use crate::layout::path_string;
use crate::services::identity_scanner::IdentityScanner;
use crate::services::manifest::{Manifest, ManifestStatus};
use mrsw_common::Identity;
use std::collections::BTreeSet;
use std::path::Path;

/// How the work set of a run was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// No manifest existed; the full universe became the initial record
    Bootstrap,
    /// Manifest existed; only unseen identities were recorded
    Incremental,
}

/// Outcome of one discovery pass
#[derive(Debug, Clone)]
pub struct Discovery {
    pub kind: DiscoveryKind,
    /// Identities recorded by this pass
    pub identities: BTreeSet<Identity>,
    /// Manifest row count after the pass
    pub manifest_rows: usize,
}

/// Scans the raw tree and keeps the manifest in step with it
#[derive(Debug, Clone)]
pub struct Reconciler {
    scanner: IdentityScanner,
}

impl Reconciler {
    pub fn new(scanner: IdentityScanner) -> Self {
        Self { scanner }
    }

    /// Bootstrap or reconcile depending on whether the manifest exists
    pub fn discover(&self, root: &Path, manifest_path: &Path) -> RunResult<Discovery> {
        self.discover_inner(root, manifest_path, true)
    }

    /// Same as [`Reconciler::discover`] but leaves the manifest untouched
    pub fn preview(&self, root: &Path, manifest_path: &Path) -> RunResult<Discovery> {
        self.discover_inner(root, manifest_path, false)
    }

    fn discover_inner(
        &self,
        root: &Path,
        manifest_path: &Path,
        persist: bool,
    ) -> RunResult<Discovery> {
        let universe = self.scan_universe(root)?;
        let manifest = Manifest::load(manifest_path)?;

        let kind = match manifest.status() {
            ManifestStatus::Missing => DiscoveryKind::Bootstrap,
            ManifestStatus::Present => DiscoveryKind::Incremental,
        };
        let (identities, manifest_rows) = self.record(root, manifest, &universe, persist)?;

        tracing::info!(
            kind = ?kind,
            persisted = persist,
            new_identities = identities.len(),
            manifest_rows,
            "Discovery complete"
        );

        Ok(Discovery {
            kind,
            identities,
            manifest_rows,
        })
    }

    /// Write the current universe as the initial manifest and return all of it
    ///
    /// Rows already present in an existing file are kept.
    pub fn bootstrap(&self, root: &Path, manifest_path: &Path) -> RunResult<BTreeSet<Identity>> {
        let universe = self.scan_universe(root)?;
        let manifest = Manifest::load(manifest_path)?;
        if manifest.status() == ManifestStatus::Present {
            tracing::warn!(
                manifest = %manifest_path.display(),
                "Bootstrap requested but manifest already exists, appending only"
            );
        }

        self.record(root, manifest, &universe, true)?;
        tracing::info!(identities = universe.len(), "Created participant manifest");
        Ok(universe)
    }

    /// Record and return the identities on disk that the manifest has not seen
    pub fn reconcile(&self, root: &Path, manifest_path: &Path) -> RunResult<BTreeSet<Identity>> {
        let universe = self.scan_universe(root)?;
        let manifest = Manifest::load(manifest_path)?;
        let (new_identities, _) = self.record(root, manifest, &universe, true)?;
        Ok(new_identities)
    }

    fn scan_universe(&self, root: &Path) -> RunResult<BTreeSet<Identity>> {
        let raw_dir = root.join("raw");
        Ok(self.scanner.scan(&raw_dir)?)
    }

    /// Append `universe - manifest` with a fresh timestamp, saving when `persist`
    fn record(
        &self,
        root: &Path,
        mut manifest: Manifest,
        universe: &BTreeSet<Identity>,
        persist: bool,
    ) -> RunResult<(BTreeSet<Identity>, usize)> {
        let existing = manifest.identities();
        let difference: BTreeSet<Identity> = universe.difference(&existing).cloned().collect();

        for identity in &difference {
            tracing::info!(identity = %identity, "New identity discovered");
        }

        manifest.append(difference.iter(), &path_string(root), mrsw_common::time::now());
        if persist {
            manifest.save()?;
        }

        Ok((difference, manifest.len()))
    }
}
