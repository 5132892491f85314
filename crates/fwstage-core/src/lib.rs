mod command;
mod config;
mod error;
mod exec;
mod layout;
mod log;
mod stage;
mod state;
mod version;

pub use command::{CommandResult, CommandRunner, SystemRunner};
pub use config::{
    config_file_version, parse_config, UpgradeConfig, DEFAULT_HTTP_TIMEOUT_SECS,
    DEFAULT_MIN_FREE_MB, DEFAULT_RESUME_SETTLE_SECS,
};
pub use error::{UpgradeError, UpgradeResult};
pub use exec::{Executor, FailurePolicy};
pub use layout::HostLayout;
pub use log::{LogLevel, RunKind, RunLog};
pub use stage::StageId;
pub use state::{parse_upgrade_state, serialize_upgrade_state, UpgradeState};
pub use version::{strip_revision_suffix, Branch, UpgradeKind, VersionInfo, VersionTarget};

#[cfg(test)]
mod tests;
