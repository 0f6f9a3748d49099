use devrun_core::PortError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a blocking step (install, setup, build) did not finish cleanly.
#[derive(Debug, Error)]
pub enum StepFailure {
    #[error("`{command}` exited with code {code}")]
    Exit { command: String, code: i32 },
    #[error("`{command}` was terminated by a signal")]
    Signaled { command: String },
    #[error("`{command}` was not started: shutdown in progress")]
    Cancelled { command: String },
    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
    #[error("could not spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl StepFailure {
    /// The step was stopped from outside rather than failing on its own.
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            StepFailure::Signaled { .. } | StepFailure::Cancelled { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error("no run command configured for {0}")]
    MissingRunCommand(String),
    #[error("working directory {} does not exist", .0.display())]
    MissingWorkdir(PathBuf),
    #[error("aborted: required environment variable {0} is not set")]
    EnvAborted(String),
    #[error("environment prompt failed: {0}")]
    Prompt(#[source] io::Error),
    #[error("dependency install interrupted: {0}")]
    Install(#[source] StepFailure),
    #[error("setup phase failed: {0}")]
    Setup(#[source] StepFailure),
    #[error("auto-build failed: {0}")]
    Build(#[source] StepFailure),
    #[error("port resolution failed: {0}")]
    Port(#[from] PortError),
    #[error("run phase failed: {0}")]
    Run(#[source] StepFailure),
    #[error("dashboard failed: {0}")]
    Dashboard(#[source] io::Error),
}

impl OrchestrateError {
    /// A step killed by a signal, which is what a user-requested shutdown
    /// does to whatever is running, or one refused because shutdown began.
    pub fn is_interrupted(&self) -> bool {
        match self {
            OrchestrateError::Install(failure)
            | OrchestrateError::Setup(failure)
            | OrchestrateError::Build(failure)
            | OrchestrateError::Run(failure) => failure.is_interruption(),
            _ => false,
        }
    }
}
