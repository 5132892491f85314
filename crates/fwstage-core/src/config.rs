use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::HostLayout;

pub const DEFAULT_MIN_FREE_MB: u64 = 2000;
pub const DEFAULT_RESUME_SETTLE_SECS: u64 = 10;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    pub version: u32,
    pub host_root: PathBuf,
    pub min_free_mb: u64,
    pub resume_settle_secs: u64,
    pub mirror_url: Option<String>,
    pub http_timeout_secs: u64,
    pub critical_services: Vec<String>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            version: config_file_version(),
            host_root: PathBuf::from("/"),
            min_free_mb: DEFAULT_MIN_FREE_MB,
            resume_settle_secs: DEFAULT_RESUME_SETTLE_SECS,
            mirror_url: None,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            critical_services: vec!["configd".to_string(), "syslog-ng".to_string()],
        }
    }
}

impl UpgradeConfig {
    pub fn layout(&self) -> HostLayout {
        HostLayout::new(&self.host_root)
    }

    /// Loads `path`, or the defaults when the file does not exist and no path was forced.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound && !required => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };
        parse_config(&raw)
            .with_context(|| format!("failed parsing config file: {}", path.display()))
    }
}

pub fn parse_config(content: &str) -> Result<UpgradeConfig> {
    let config = toml::from_str::<UpgradeConfig>(content)?;
    let expected = config_file_version();
    if config.version != expected {
        anyhow::bail!(
            "unsupported config version {} (expected {})",
            config.version,
            expected
        );
    }
    if config.http_timeout_secs == 0 {
        anyhow::bail!("http_timeout_secs must be greater than zero");
    }
    Ok(config)
}

pub fn config_file_version() -> u32 {
    1
}
