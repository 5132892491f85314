use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use fwstage_core::{
    parse_upgrade_state, serialize_upgrade_state, HostLayout, UpgradeError, UpgradeResult,
    UpgradeState, VersionTarget,
};

/// The single on-disk checkpoint. Its presence is the cross-run lock.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(layout: &HostLayout) -> Self {
        Self {
            path: layout.state_path(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// `Ok(None)` when no run is in progress. An unreadable record is reported, never removed.
    pub fn load(&self) -> UpgradeResult<Option<UpgradeState>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(UpgradeError::StateCorruption {
                    path: self.path.clone(),
                    reason: err.to_string(),
                });
            }
        };
        parse_upgrade_state(&raw)
            .map(Some)
            .map_err(|err| UpgradeError::StateCorruption {
                path: self.path.clone(),
                reason: format!("{err:#}"),
            })
    }

    /// Replaces the record atomically: temporary sibling, fsync, rename.
    pub fn save(&self, state: &UpgradeState) -> Result<()> {
        let tmp = self.write_sibling(state, "tmp")?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "failed to replace checkpoint {} with {}",
                self.path.display(),
                tmp.display()
            )
        })?;
        sync_parent(&self.path);
        Ok(())
    }

    /// Creates the record only if none exists, so two runs can never both own it.
    pub fn claim(&self, state: &UpgradeState) -> UpgradeResult<()> {
        let tmp = self.write_sibling(state, "claim")?;
        let linked = fs::hard_link(&tmp, &self.path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                sync_parent(&self.path);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let detail = match self.load() {
                    Ok(Some(existing)) => format!(
                        " (stage {}, target {})",
                        existing.stage, existing.target
                    ),
                    _ => String::new(),
                };
                Err(UpgradeError::SafetyGateBlocked(format!(
                    "an upgrade is already in progress{detail}"
                )))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("failed to claim checkpoint {}", self.path.display()))
                .into()),
        }
    }

    /// Returns whether a record was removed.
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove checkpoint {}", self.path.display())),
        }
    }

    fn write_sibling(&self, state: &UpgradeState, suffix: &str) -> Result<PathBuf> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self
            .path
            .with_extension(format!("state.{suffix}.{}", std::process::id()));
        let raw = serialize_upgrade_state(state)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create checkpoint temp file {}", tmp.display()))?;
        file.write_all(raw.as_bytes())
            .with_context(|| format!("failed to write checkpoint temp file {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync checkpoint temp file {}", tmp.display()))?;
        Ok(tmp)
    }
}

fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

pub fn read_completion_record(layout: &HostLayout) -> Result<Option<VersionTarget>> {
    let path = layout.completion_record_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read completion record {}", path.display()));
        }
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    VersionTarget::parse(raw)
        .map(Some)
        .with_context(|| format!("failed parsing completion record {}", path.display()))
}

pub fn write_completion_record(layout: &HostLayout, target: &VersionTarget) -> Result<PathBuf> {
    let path = layout.completion_record_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, format!("{target}\n"))
        .with_context(|| format!("failed to write completion record {}", path.display()))?;
    Ok(path)
}
