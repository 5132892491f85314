//! Failure taxonomy surfaced to operators and remote callers.

use std::path::PathBuf;

use thiserror::Error;

use crate::CommandResult;

pub type UpgradeResult<T> = std::result::Result<T, UpgradeError>;

#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("pre-flight check failed: {0}")]
    PreflightFailure(String),

    #[error("unable to determine the installed version: {0}")]
    VersionUnresolvable(String),

    #[error("refusing to continue: {0}")]
    SafetyGateBlocked(String),

    #[error(
        "command failed: {command} (exit {})\nstdout:\n{}\nstderr:\n{}",
        .result.exit_code,
        .result.stdout.trim_end(),
        .result.stderr.trim_end()
    )]
    CommandFailure {
        command: String,
        result: CommandResult,
    },

    #[error("checkpoint {} is unreadable ({reason}); run with --clean to discard it", .path.display())]
    StateCorruption { path: PathBuf, reason: String },

    #[error(transparent)]
    Other(anyhow::Error),
}

impl UpgradeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            UpgradeError::Other(_) => 1,
            UpgradeError::PreflightFailure(_) => 2,
            UpgradeError::VersionUnresolvable(_) => 3,
            UpgradeError::SafetyGateBlocked(_) => 4,
            UpgradeError::CommandFailure { .. } => 5,
            UpgradeError::StateCorruption { .. } => 6,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpgradeError::PreflightFailure(_) => "preflight-failure",
            UpgradeError::VersionUnresolvable(_) => "version-unresolvable",
            UpgradeError::SafetyGateBlocked(_) => "safety-gate-blocked",
            UpgradeError::CommandFailure { .. } => "command-failure",
            UpgradeError::StateCorruption { .. } => "state-corruption",
            UpgradeError::Other(_) => "internal",
        }
    }
}

// Taxonomy errors raised inside anyhow plumbing come back out as themselves.
impl From<anyhow::Error> for UpgradeError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<UpgradeError>() {
            Ok(inner) => inner,
            Err(err) => UpgradeError::Other(err),
        }
    }
}
