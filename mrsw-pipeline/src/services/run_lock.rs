//! Single-run lock for a study root
//!
//! Two runs against the same root would append the same identities to the
//! manifest twice. The lock file is created exclusively and holds the owning
//! process id; it is removed when the guard drops.
//!
//! A run killed before the guard drops leaves its file behind. Such a lock is
//! reclaimed when its recorded process is gone, or, where liveness cannot be
//! checked or the file holds no pid, once it is older than the grace period.

use crate::error::{RunError, RunResult};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Age after which a lock with unknown holder state counts as stale
pub const STALE_LOCK_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

/// What the existing lock file says about its holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Alive(u32),
    Dead(u32),
    /// Pid recorded but liveness cannot be checked on this platform
    Unknown(u32),
    /// No parseable pid in the file
    Unrecorded,
}

impl Holder {
    fn read(path: &Path) -> Self {
        let contents = std::fs::read_to_string(path).unwrap_or_default();
        match contents.trim().parse::<u32>() {
            Ok(pid) => match process_alive(pid) {
                Some(true) => Holder::Alive(pid),
                Some(false) => Holder::Dead(pid),
                None => Holder::Unknown(pid),
            },
            Err(_) => Holder::Unrecorded,
        }
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> Option<bool> {
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() {
        return None;
    }
    Some(proc_root.join(pid.to_string()).exists())
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> Option<bool> {
    None
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn is_stale(holder: Holder, age: Option<Duration>, grace: Duration) -> bool {
    match holder {
        Holder::Alive(_) => false,
        Holder::Dead(_) => true,
        Holder::Unknown(_) | Holder::Unrecorded => age.is_some_and(|age| age > grace),
    }
}

/// Held for the duration of a run
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Create the lock file, failing with [`RunError::Locked`] if a live run holds it
    pub fn acquire(path: &Path) -> RunResult<Self> {
        Self::acquire_with_grace(path, STALE_LOCK_GRACE)
    }

    /// Like [`RunLock::acquire`] with a custom stale grace period
    pub fn acquire_with_grace(path: &Path, grace: Duration) -> RunResult<Self> {
        match Self::create(path) {
            Err(RunError::Locked(_)) => {}
            other => return other,
        }

        let holder = Holder::read(path);
        let age = lock_age(path);
        if !is_stale(holder, age, grace) {
            tracing::error!(
                lock = %path.display(),
                holder = ?holder,
                "Study is locked by another run"
            );
            return Err(RunError::Locked(path.to_path_buf()));
        }

        tracing::warn!(
            lock = %path.display(),
            holder = ?holder,
            age_secs = age.map(|a| a.as_secs()),
            "Reclaiming stale run lock"
        );
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // A concurrent run may have reclaimed it first
        Self::create(path)
    }

    fn create(path: &Path) -> RunResult<Self> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(RunError::Locked(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        writeln!(file, "{}", std::process::id())?;
        tracing::debug!(lock = %path.display(), "Acquired run lock");

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "Failed to remove run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".mrsw.lock");

        let lock = RunLock::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        assert!(matches!(RunLock::acquire(&path), Err(RunError::Locked(_))));

        drop(lock);
        assert!(!path.exists());
        assert!(RunLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_missing_parent_is_io_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("absent/.mrsw.lock");
        assert!(matches!(RunLock::acquire(&path), Err(RunError::Io(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dead_holder_lock_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".mrsw.lock");
        // Above the kernel's PID_MAX_LIMIT, so never a running process
        std::fs::write(&path, "99999999\n").unwrap();

        let lock = RunLock::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_live_holder_lock_is_kept() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".mrsw.lock");
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        assert!(matches!(
            RunLock::acquire_with_grace(&path, Duration::ZERO),
            Err(RunError::Locked(_))
        ));
        assert!(path.exists());
    }

    #[test]
    fn test_unrecorded_holder_waits_for_grace() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".mrsw.lock");
        std::fs::write(&path, "").unwrap();

        assert!(matches!(RunLock::acquire(&path), Err(RunError::Locked(_))));

        std::thread::sleep(Duration::from_millis(20));
        assert!(RunLock::acquire_with_grace(&path, Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_stale_rules() {
        let old = Some(Duration::from_secs(100));
        let grace = Duration::from_secs(10);
        assert!(!is_stale(Holder::Alive(1), old, grace));
        assert!(is_stale(Holder::Dead(1), None, grace));
        assert!(is_stale(Holder::Unknown(1), old, grace));
        assert!(!is_stale(Holder::Unknown(1), Some(Duration::from_secs(1)), grace));
        assert!(!is_stale(Holder::Unrecorded, None, grace));
    }
}
