use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

use fwstage_core::{Executor, HostLayout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub config_copy: PathBuf,
    pub package_list: PathBuf,
    /// Digest of the copied configuration, verified against the source. `None` in dry-run.
    pub config_sha256: Option<String>,
}

/// Copies `config.xml` and the installed package list into the backup directory.
pub fn create_backup(executor: &Executor<'_>, layout: &HostLayout) -> Result<BackupSummary> {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
    let source = layout.config_xml_path();
    let backup_dir = layout.backup_dir();
    let config_copy = backup_dir.join(format!("config-backup-{stamp}.xml"));
    let package_list = backup_dir.join(format!("packages-{stamp}.txt"));

    let digest = executor.perform(
        &format!("back up {} to {}", source.display(), config_copy.display()),
        || {
            if !source.exists() {
                return Err(anyhow!(
                    "configuration file not found: {}",
                    source.display()
                ));
            }
            fs::create_dir_all(&backup_dir)
                .with_context(|| format!("failed to create {}", backup_dir.display()))?;
            fs::copy(&source, &config_copy).with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    source.display(),
                    config_copy.display()
                )
            })?;
            verify_copy(&source, &config_copy)
        },
    )?;

    let packages = executor
        .inspect("pkg query '%n-%v'")
        .unwrap_or_default();
    executor.perform(
        &format!("save package list to {}", package_list.display()),
        || {
            fs::write(&package_list, format!("{}\n", packages.trim_end()))
                .with_context(|| format!("failed to write {}", package_list.display()))
        },
    )?;

    Ok(BackupSummary {
        config_copy,
        package_list,
        config_sha256: digest,
    })
}

fn verify_copy(source: &Path, copy: &Path) -> Result<String> {
    let expected = sha256_file(source)?;
    let actual = sha256_file(copy)?;
    if expected != actual {
        return Err(anyhow!(
            "backup verification failed for {}: sha256 {actual} does not match source {expected}",
            copy.display()
        ));
    }
    Ok(actual)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
