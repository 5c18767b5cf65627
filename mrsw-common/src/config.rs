//! Bootstrap configuration loading
//!
//! Configuration is a single TOML file. Every key is optional and falls back
//! to a built-in default, so a study can run with no file at all.
//!
//! # Config File Priority
//!
//! 1. Command-line argument (`--config`)
//! 2. Environment variable (`MRSW_CONFIG`)
//! 3. `{config_dir}/mrsw/config.toml`
//! 4. Built-in defaults (no file)
//!
//! A file named explicitly by (1) or (2) must exist. A missing file at (3)
//! only produces a warning.

use crate::identity::DEFAULT_SESSION;
use crate::time::secs_to_duration;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "MRSW_CONFIG";

/// Stage names understood by the pipeline, in default execution order
pub const DEFAULT_STAGE_ORDER: [&str; 4] = ["dicomsort", "bidscoin", "job", "analysis"];

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Manifest CSV (default `{root}/raw/participant_log.csv`)
    #[serde(default)]
    pub manifest_file: Option<PathBuf>,

    /// Analysis settings template (default `{root}/../src/OSPREY_master_settings.json`)
    #[serde(default)]
    pub settings_template: Option<PathBuf>,

    /// Notification config (default `{root}/../src/EmailConfig.json`)
    #[serde(default)]
    pub notification_config: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub settle: SettleConfig,

    #[serde(default)]
    pub job: JobConfig,

    #[serde(default)]
    pub stages: StagesConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins if set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Explicit log file; overrides the study log location
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Append to `{root}/{study}.log` when no explicit file is given
    #[serde(default = "default_true")]
    pub study_log: bool,

    /// Also append each identity's records to `raw/{sub}/{sub}_{ses}.log`
    #[serde(default = "default_true")]
    pub identity_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            study_log: true,
            identity_log: true,
        }
    }
}

/// Directory naming conventions for identity discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,

    /// Session label synthesized for subjects without session directories
    #[serde(default = "default_session")]
    pub default_session: String,

    /// Hand a freshly bootstrapped universe to the pipeline
    #[serde(default = "default_true")]
    pub process_bootstrap: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            subject_prefix: default_subject_prefix(),
            session_prefix: default_session_prefix(),
            default_session: default_session(),
            process_bootstrap: true,
        }
    }
}

/// Settling delay applied once per run before any stage executes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleConfig {
    #[serde(default = "default_settle_base")]
    pub base_secs: u64,

    #[serde(default = "default_settle_per_subject")]
    pub per_subject_secs: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            base_secs: default_settle_base(),
            per_subject_secs: default_settle_per_subject(),
        }
    }
}

impl SettleConfig {
    /// Delay for a run with `new_subjects` newly discovered subjects
    ///
    /// Zero when nothing new was found.
    pub fn delay_for(&self, new_subjects: usize) -> Duration {
        if new_subjects == 0 {
            return Duration::ZERO;
        }
        let per_subject = self.per_subject_secs.saturating_mul(new_subjects as u64);
        secs_to_duration(self.base_secs.saturating_add(per_subject))
    }
}

/// Job document discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Glob for anatomical images inside `{session_dir}/anat`
    #[serde(default = "default_anat_pattern")]
    pub anat_pattern: String,

    /// Spectroscopy directory names under the session directory, first existing wins
    #[serde(default = "default_spectroscopy_dirs")]
    pub spectroscopy_dirs: Vec<String>,

    /// Job file name suffix, appended to `{subject}_{session}_`
    #[serde(default = "default_job_suffix")]
    pub job_suffix: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            anat_pattern: default_anat_pattern(),
            spectroscopy_dirs: default_spectroscopy_dirs(),
            job_suffix: default_job_suffix(),
        }
    }
}

/// External command for one stage
///
/// `args` and `working_dir` may contain `{placeholder}` tokens that the
/// pipeline fills per identity. Unknown tokens are passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    /// Directories prepended to `PATH` for this command only
    #[serde(default)]
    pub path_prepend: Vec<PathBuf>,

    /// Upper bound on the wait; the child is killed when it expires
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            path_prepend: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(secs_to_duration)
    }
}

/// Stage chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Execution order by stage name
    #[serde(default = "default_stage_order")]
    pub order: Vec<String>,

    #[serde(default = "default_dicomsort")]
    pub dicomsort: CommandSpec,

    #[serde(default = "default_bidscoin")]
    pub bidscoin: CommandSpec,

    #[serde(default = "default_analysis")]
    pub analysis: CommandSpec,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            order: default_stage_order(),
            dicomsort: default_dicomsort(),
            bidscoin: default_bidscoin(),
            analysis: default_analysis(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_subject_prefix() -> String {
    "sub".to_string()
}

fn default_session_prefix() -> String {
    "ses".to_string()
}

fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}

fn default_settle_base() -> u64 {
    10
}

fn default_settle_per_subject() -> u64 {
    60
}

fn default_anat_pattern() -> String {
    "*T1w.ni*".to_string()
}

fn default_spectroscopy_dirs() -> Vec<String> {
    vec!["mrs".to_string(), "extra_data".to_string()]
}

fn default_job_suffix() -> String {
    "job.json".to_string()
}

fn default_stage_order() -> Vec<String> {
    DEFAULT_STAGE_ORDER.iter().map(|s| s.to_string()).collect()
}

fn default_dicomsort() -> CommandSpec {
    CommandSpec::new("dicomsort", &["-f", "{ScanningSequence}", "{identity_raw_dir}"])
}

fn default_bidscoin() -> CommandSpec {
    CommandSpec::new(
        "bidscoiner",
        &[
            "-f",
            "{raw_dir}",
            "{bids_dir}",
            "-b",
            "{bids_dir}/code/bidscoin/bidsmap.yaml",
            "-p",
            "{subject}",
        ],
    )
}

fn default_analysis() -> CommandSpec {
    let mut spec = CommandSpec::new("OspreyCMD", &["{job_file}"]);
    spec.working_dir = Some("{tool_dir}".to_string());
    spec
}

impl TomlConfig {
    /// Parse configuration text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make discovery or job generation meaningless
    pub fn validate(&self) -> Result<()> {
        let discovery = &self.discovery;
        for (key, value) in [
            ("discovery.subject_prefix", &discovery.subject_prefix),
            ("discovery.session_prefix", &discovery.session_prefix),
            ("discovery.default_session", &discovery.default_session),
            ("job.anat_pattern", &self.job.anat_pattern),
            ("job.job_suffix", &self.job.job_suffix),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} must not be empty", key)));
            }
        }

        if self.job.spectroscopy_dirs.is_empty() {
            return Err(Error::Config(
                "job.spectroscopy_dirs must name at least one directory".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for name in &self.stages.order {
            if !seen.insert(name.as_str()) {
                return Err(Error::Config(format!(
                    "stage '{}' appears more than once in stages.order",
                    name
                )));
            }
        }

        for (name, spec) in [
            ("dicomsort", &self.stages.dicomsort),
            ("bidscoin", &self.stages.bidscoin),
            ("analysis", &self.stages.analysis),
        ] {
            if spec.program.trim().is_empty() {
                return Err(Error::Config(format!(
                    "stages.{}.program must not be empty",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Locate the configuration file following the priority order above
///
/// Returns the path and whether it was requested explicitly.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<(PathBuf, bool)> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some((path.to_path_buf(), true));
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some((PathBuf::from(path), true));
        }
    }

    // Priority 3: Per-user config directory
    dirs::config_dir().map(|d| (d.join("mrsw").join("config.toml"), false))
}

/// Where the loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read from this file
    File(PathBuf),
    /// Implicit per-user file absent; built-in defaults used
    MissingDefault(PathBuf),
    /// No per-user config directory on this platform; built-in defaults used
    NoConfigDir,
}

impl ConfigSource {
    /// Report the outcome; call once a subscriber is installed
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => info!("Loaded configuration from {}", path.display()),
            ConfigSource::MissingDefault(path) => warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            ),
            ConfigSource::NoConfigDir => {
                warn!("Could not determine config directory, using built-in defaults")
            }
        }
    }
}

/// Load configuration without logging, returning where it came from
///
/// The logging level lives in the configuration itself, so callers load it
/// before a subscriber exists and report the [`ConfigSource`] afterwards.
pub fn load_config_with_source(cli_arg: Option<&Path>) -> Result<(TomlConfig, ConfigSource)> {
    let Some((path, explicit)) = resolve_config_path(cli_arg) else {
        return Ok((TomlConfig::default(), ConfigSource::NoConfigDir));
    };

    if !path.exists() {
        if explicit {
            return Err(Error::NotFound(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        return Ok((TomlConfig::default(), ConfigSource::MissingDefault(path)));
    }

    let content = std::fs::read_to_string(&path)?;
    let config = TomlConfig::from_toml_str(&content)?;
    Ok((config, ConfigSource::File(path)))
}

/// Load configuration, degrading to defaults when no file is available
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    let (config, source) = load_config_with_source(cli_arg)?;
    source.log();
    Ok(config)
}
