//! Study directory layout
//!
//! ```text
//! {root}/raw/{subject}/{session}              raw acquisitions (session optional)
//! {root}/raw/participant_log.csv              manifest
//! {root}/bids/{subject}/{session}             converted data (session optional)
//! {root}/bids/derivatives/{subject}/{session} analysis output
//! {root}/../src/                              settings template, notification config
//! ```

use mrsw_common::config::{JobConfig, TomlConfig};
use mrsw_common::identity::{normalize_separators, terminal_label};
use mrsw_common::Identity;
use std::path::{Path, PathBuf};

const MANIFEST_FILE_NAME: &str = "participant_log.csv";
const LOCK_FILE_NAME: &str = ".mrsw.lock";
const SETTINGS_TEMPLATE_NAME: &str = "OSPREY_master_settings.json";
const NOTIFICATION_CONFIG_NAME: &str = "EmailConfig.json";

/// Resolved paths for one study root
#[derive(Debug, Clone)]
pub struct StudyLayout {
    root: PathBuf,
    manifest_file: PathBuf,
    settings_template: PathBuf,
    notification_config: PathBuf,
    job: JobConfig,
}

impl StudyLayout {
    /// Resolve the layout, applying config overrides
    pub fn new(root: &Path, config: &TomlConfig) -> Self {
        let root = PathBuf::from(normalize_separators(&root.to_string_lossy()));
        let src_dir = root.parent().unwrap_or(&root).join("src");

        Self {
            manifest_file: config
                .manifest_file
                .clone()
                .unwrap_or_else(|| root.join("raw").join(MANIFEST_FILE_NAME)),
            settings_template: config
                .settings_template
                .clone()
                .unwrap_or_else(|| src_dir.join(SETTINGS_TEMPLATE_NAME)),
            notification_config: config
                .notification_config
                .clone()
                .unwrap_or_else(|| src_dir.join(NOTIFICATION_CONFIG_NAME)),
            job: config.job.clone(),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Study name: terminal component of the root path
    pub fn study_name(&self) -> String {
        terminal_label(&self.root.to_string_lossy()).unwrap_or_else(|| "study".to_string())
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn bids_dir(&self) -> PathBuf {
        self.root.join("bids")
    }

    pub fn derivatives_dir(&self) -> PathBuf {
        self.bids_dir().join("derivatives")
    }

    pub fn manifest_file(&self) -> &Path {
        &self.manifest_file
    }

    pub fn settings_template(&self) -> &Path {
        &self.settings_template
    }

    pub fn notification_config(&self) -> &Path {
        &self.notification_config
    }

    pub fn job_config(&self) -> &JobConfig {
        &self.job
    }

    pub fn lock_file(&self) -> PathBuf {
        self.raw_dir().join(LOCK_FILE_NAME)
    }

    /// Default study log: `{root}/{study}.log`
    pub fn study_log_file(&self) -> PathBuf {
        self.root.join(format!("{}.log", self.study_name()))
    }

    /// Per-identity log: `raw/{sub}/{sub}_{ses}.log`
    pub fn identity_log_file(&self, identity: &Identity) -> PathBuf {
        self.raw_dir()
            .join(&identity.subject)
            .join(format!("{}.log", identity.combined_key()))
    }

    /// Raw directory for an identity, falling back to the subject level
    pub fn identity_raw_dir(&self, identity: &Identity) -> PathBuf {
        let subject_dir = self.raw_dir().join(&identity.subject);
        let session_dir = subject_dir.join(&identity.session);
        if session_dir.is_dir() {
            session_dir
        } else {
            subject_dir
        }
    }

    /// Converted-data directory for an identity, falling back to the subject level
    pub fn session_dir(&self, identity: &Identity) -> PathBuf {
        let subject_dir = self.bids_dir().join(&identity.subject);
        let session_dir = subject_dir.join(&identity.session);
        if session_dir.is_dir() {
            session_dir
        } else {
            subject_dir
        }
    }

    /// Spectroscopy data directory inside a session directory
    ///
    /// First configured name that exists wins; when none exists the last
    /// configured name is returned so that globbing simply finds nothing.
    pub fn spectroscopy_dir(&self, session_dir: &Path) -> PathBuf {
        self.job
            .spectroscopy_dirs
            .iter()
            .map(|name| session_dir.join(name))
            .find(|dir| dir.is_dir())
            .unwrap_or_else(|| {
                let fallback = self.job.spectroscopy_dirs.last().map(String::as_str);
                session_dir.join(fallback.unwrap_or("mrs"))
            })
    }

    /// Analysis output directory (always includes the session level)
    pub fn output_dir(&self, identity: &Identity) -> PathBuf {
        self.derivatives_dir()
            .join(&identity.subject)
            .join(&identity.session)
    }

    /// `{session_dir}/{subject}_{session}_{suffix}`
    pub fn job_file(&self, identity: &Identity) -> PathBuf {
        self.session_dir(identity).join(format!(
            "{}_{}",
            identity.combined_key(),
            self.job.job_suffix
        ))
    }
}

/// Forward-slash string form of a path, as written into job documents
pub fn path_string(path: &Path) -> String {
    normalize_separators(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn identity() -> Identity {
        Identity::new("sub-01", "ses-02").unwrap()
    }

    #[test]
    fn test_defaults_relative_to_root() {
        let layout = StudyLayout::new(Path::new("/data/studyA"), &TomlConfig::default());
        assert_eq!(
            layout.manifest_file(),
            Path::new("/data/studyA/raw/participant_log.csv")
        );
        assert_eq!(
            layout.settings_template(),
            Path::new("/data/src/OSPREY_master_settings.json")
        );
        assert_eq!(
            layout.notification_config(),
            Path::new("/data/src/EmailConfig.json")
        );
        assert_eq!(layout.study_name(), "studyA");
        assert_eq!(layout.study_log_file(), Path::new("/data/studyA/studyA.log"));
        assert_eq!(layout.lock_file(), Path::new("/data/studyA/raw/.mrsw.lock"));
        assert_eq!(
            layout.identity_log_file(&identity()),
            Path::new("/data/studyA/raw/sub-01/sub-01_ses-02.log")
        );
    }

    #[test]
    fn test_config_overrides_manifest_path() {
        let config = TomlConfig {
            manifest_file: Some(PathBuf::from("/elsewhere/log.csv")),
            ..TomlConfig::default()
        };
        let layout = StudyLayout::new(Path::new("/data/studyA"), &config);
        assert_eq!(layout.manifest_file(), Path::new("/elsewhere/log.csv"));
    }

    #[test]
    fn test_session_dir_falls_back_to_subject() {
        let temp = TempDir::new().unwrap();
        let layout = StudyLayout::new(temp.path(), &TomlConfig::default());
        fs::create_dir_all(temp.path().join("bids/sub-01")).unwrap();

        assert_eq!(
            layout.session_dir(&identity()),
            layout.bids_dir().join("sub-01")
        );

        fs::create_dir_all(temp.path().join("bids/sub-01/ses-02")).unwrap();
        assert_eq!(
            layout.session_dir(&identity()),
            layout.bids_dir().join("sub-01/ses-02")
        );
    }

    #[test]
    fn test_identity_raw_dir_falls_back_to_subject() {
        let temp = TempDir::new().unwrap();
        let layout = StudyLayout::new(temp.path(), &TomlConfig::default());
        fs::create_dir_all(temp.path().join("raw/sub-01")).unwrap();

        assert_eq!(
            layout.identity_raw_dir(&identity()),
            layout.raw_dir().join("sub-01")
        );
    }

    #[test]
    fn test_spectroscopy_dir_prefers_first_existing() {
        let temp = TempDir::new().unwrap();
        let layout = StudyLayout::new(temp.path(), &TomlConfig::default());
        let session = temp.path().join("bids/sub-01/ses-02");

        fs::create_dir_all(session.join("extra_data")).unwrap();
        assert_eq!(layout.spectroscopy_dir(&session), session.join("extra_data"));

        fs::create_dir_all(session.join("mrs")).unwrap();
        assert_eq!(layout.spectroscopy_dir(&session), session.join("mrs"));
    }

    #[test]
    fn test_job_file_name() {
        let temp = TempDir::new().unwrap();
        let layout = StudyLayout::new(temp.path(), &TomlConfig::default());
        assert_eq!(
            layout.job_file(&identity()),
            layout.bids_dir().join("sub-01").join("sub-01_ses-02_job.json")
        );
        assert_eq!(
            layout.output_dir(&identity()),
            layout.derivatives_dir().join("sub-01").join("ses-02")
        );
    }

    #[test]
    fn test_path_string_uses_forward_slashes() {
        assert_eq!(path_string(Path::new("a\\b\\c.nii.gz")), "a/b/c.nii.gz");
    }
}
