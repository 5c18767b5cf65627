//! External command stages
//!
//! Resolves a [`CommandSpec`] for one identity and runs it to completion.
//! The wait is bounded by the configured timeout and by the run's cancellation
//! token; either one kills the child. A non-zero exit status is a failure.

use super::stage::{SharedContext, Stage, StageContext};
use async_trait::async_trait;
use mrsw_common::config::CommandSpec;
use mrsw_common::Identity;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::layout::path_string;

/// Failure while launching or waiting on an external tool, or writing an artifact
#[derive(Debug, Error)]
pub enum StageExecutionError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("waiting on `{command}` failed: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    ExitStatus { command: String, status: ExitStatus },

    #[error("`{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("`{command}` cancelled")]
    Cancelled { command: String },

    #[error("artifact {path}: {reason}")]
    Artifact { path: PathBuf, reason: String },
}

/// Placeholder values for one identity
pub fn placeholders(shared: &SharedContext, identity: &Identity) -> Vec<(&'static str, String)> {
    let layout = &shared.layout;
    vec![
        ("root", path_string(shared.root())),
        ("raw_dir", path_string(&layout.raw_dir())),
        ("bids_dir", path_string(&layout.bids_dir())),
        ("subject", identity.subject.clone()),
        ("session", identity.session.clone()),
        ("identity_raw_dir", path_string(&layout.identity_raw_dir(identity))),
        ("session_dir", path_string(&layout.session_dir(identity))),
        ("job_file", path_string(&layout.job_file(identity))),
        ("tool_dir", path_string(&shared.tool_dir)),
    ]
}

/// Replace known `{name}` tokens; anything else is left as written
pub fn expand(template: &str, vars: &[(&'static str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        let token = format!("{{{}}}", name);
        if out.contains(&token) {
            out = out.replace(&token, value);
        }
    }
    out
}

/// Command ready to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub path_prepend: Vec<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ResolvedCommand {
    pub fn resolve(spec: &CommandSpec, vars: &[(&'static str, String)]) -> Self {
        Self {
            program: expand(&spec.program, vars),
            args: spec.args.iter().map(|a| expand(a, vars)).collect(),
            working_dir: spec
                .working_dir
                .as_deref()
                .map(|dir| PathBuf::from(expand(dir, vars))),
            path_prepend: spec.path_prepend.clone(),
            timeout: spec.timeout(),
        }
    }
}

impl fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn bounded<F>(wait: F, limit: Option<Duration>) -> Waited
where
    F: Future<Output = std::io::Result<ExitStatus>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, wait).await {
            Ok(result) => Waited::Exited(result),
            Err(_) => Waited::TimedOut,
        },
        None => Waited::Exited(wait.await),
    }
}

/// Launch the command and wait for it
pub async fn run_command(
    command: &ResolvedCommand,
    cancel: &CancellationToken,
) -> Result<(), StageExecutionError> {
    let display = command.to_string();
    if cancel.is_cancelled() {
        return Err(StageExecutionError::Cancelled { command: display });
    }

    let mut cmd = tokio::process::Command::new(&command.program);
    cmd.args(&command.args).kill_on_drop(true);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }
    if !command.path_prepend.is_empty() {
        let current = std::env::var_os("PATH").unwrap_or_default();
        let dirs = command
            .path_prepend
            .iter()
            .cloned()
            .chain(std::env::split_paths(&current));
        match std::env::join_paths(dirs) {
            Ok(path) => {
                cmd.env("PATH", path);
            }
            Err(e) => {
                return Err(StageExecutionError::Spawn {
                    command: display,
                    source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
                })
            }
        }
    }

    let mut child = cmd.spawn().map_err(|source| StageExecutionError::Spawn {
        command: display.clone(),
        source,
    })?;

    let waited = tokio::select! {
        waited = bounded(child.wait(), command.timeout) => waited,
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    match waited {
        Waited::Exited(Ok(status)) if status.success() => Ok(()),
        Waited::Exited(Ok(status)) => Err(StageExecutionError::ExitStatus {
            command: display,
            status,
        }),
        Waited::Exited(Err(source)) => Err(StageExecutionError::Wait {
            command: display,
            source,
        }),
        Waited::TimedOut => {
            let _ = child.kill().await;
            Err(StageExecutionError::Timeout {
                command: display,
                seconds: command.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            })
        }
        Waited::Cancelled => {
            let _ = child.kill().await;
            Err(StageExecutionError::Cancelled { command: display })
        }
    }
}

/// Stage that runs one external command
pub struct CommandStage {
    name: String,
    spec: CommandSpec,
}

impl CommandStage {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> bool {
        let vars = placeholders(ctx.shared, ctx.identity);
        let command = ResolvedCommand::resolve(&self.spec, &vars);

        info!(stage = %self.name, command = %command, "Starting");

        if ctx.shared.dry_run {
            info!(stage = %self.name, "Dry run (command not executed)");
            return true;
        }

        match run_command(&command, &ctx.shared.cancel).await {
            Ok(()) => {
                info!(stage = %self.name, success = true, "Finished");
                true
            }
            Err(e) => {
                error!(
                    stage = %self.name,
                    command = %command,
                    error = %e,
                    success = false,
                    "Stage failed"
                );
                false
            }
        }
    }
}
