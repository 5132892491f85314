use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{StageId, VersionTarget};

/// The in-progress run checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeState {
    pub stage: StageId,
    pub target: VersionTarget,
    pub minor_only: bool,
    pub force_mode: bool,
    pub created_at: i64,
    pub log_path: PathBuf,
}

/// On-disk shape, kept field-for-field compatible with checkpoints already present on hosts.
#[derive(Debug, Serialize, Deserialize)]
struct UpgradeStateRecord {
    stage: u8,
    version: String,
    timestamp: i64,
    #[serde(default)]
    minor_only: bool,
    #[serde(default)]
    force_mode: bool,
    #[serde(default)]
    log_file: String,
}

impl UpgradeState {
    pub fn new(
        stage: StageId,
        target: VersionTarget,
        minor_only: bool,
        force_mode: bool,
        log_path: PathBuf,
    ) -> Self {
        Self {
            stage,
            target,
            minor_only,
            force_mode,
            created_at: chrono::Utc::now().timestamp(),
            log_path,
        }
    }

    pub fn with_stage(&self, stage: StageId) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }
}

pub fn serialize_upgrade_state(state: &UpgradeState) -> Result<String> {
    let record = UpgradeStateRecord {
        stage: state.stage.code(),
        version: state.target.to_string(),
        timestamp: state.created_at,
        minor_only: state.minor_only,
        force_mode: state.force_mode,
        log_file: state.log_path.display().to_string(),
    };
    let mut raw =
        serde_json::to_string_pretty(&record).context("failed to serialize upgrade state")?;
    raw.push('\n');
    Ok(raw)
}

pub fn parse_upgrade_state(raw: &str) -> Result<UpgradeState> {
    let record: UpgradeStateRecord =
        serde_json::from_str(raw).context("upgrade state is not a valid JSON record")?;
    let stage = StageId::from_code(record.stage)?;
    let target = VersionTarget::parse(&record.version)
        .with_context(|| format!("upgrade state has invalid target '{}'", record.version))?;
    Ok(UpgradeState {
        stage,
        target,
        minor_only: record.minor_only,
        force_mode: record.force_mode,
        created_at: record.timestamp,
        log_path: PathBuf::from(record.log_file),
    })
}
