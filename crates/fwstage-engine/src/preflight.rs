use fwstage_core::{Executor, HostLayout, UpgradeError, UpgradeResult};
use fwstage_oracle::{free_disk_mb, pkg_process_running};

use crate::StateStore;

pub const PKG_CHECK_COMMAND: &str = "pkg check -Ba";

/// Refuses to start while another run owns the checkpoint. A corrupt checkpoint also blocks.
pub fn ensure_no_active_run(store: &StateStore) -> UpgradeResult<()> {
    if let Some(existing) = store.load()? {
        return Err(UpgradeError::SafetyGateBlocked(format!(
            "an upgrade is already in progress (stage {}, target {}); resume it with -r or discard it with -c",
            existing.stage, existing.target
        )));
    }
    Ok(())
}

pub fn check_disk_space(executor: &Executor<'_>, min_free_mb: u64) -> UpgradeResult<u64> {
    let log = executor.log();
    let Some(available) = free_disk_mb(executor) else {
        return Err(UpgradeError::PreflightFailure(
            "unable to determine free space on /".to_string(),
        ));
    };
    log.info(&format!("Available space: {available}MB"));
    if available < min_free_mb {
        return Err(UpgradeError::PreflightFailure(format!(
            "insufficient disk space: need {min_free_mb}MB, have {available}MB"
        )));
    }
    log.success("Disk space check passed");
    Ok(available)
}

/// `pkg check -Ba` rewrites shared-library metadata, so it only runs for real in execute mode.
pub fn check_package_database(executor: &Executor<'_>) -> UpgradeResult<()> {
    executor
        .log()
        .info("Checking package database integrity (this may take a minute)...");
    let result = executor.run(PKG_CHECK_COMMAND, true)?;
    if !result.succeeded() {
        return Err(UpgradeError::PreflightFailure(format!(
            "package database check failed (exit {}): {}",
            result.exit_code,
            result.combined_output().trim()
        )));
    }
    executor.log().success("Package database is healthy");
    Ok(())
}

/// Fails when a live pkg process holds the lock. Returns whether an orphaned lock file exists.
pub fn check_pkg_lock(executor: &Executor<'_>, layout: &HostLayout) -> UpgradeResult<bool> {
    if !layout.pkg_lock_path().exists() {
        return Ok(false);
    }
    if pkg_process_running(executor) {
        return Err(UpgradeError::PreflightFailure(
            "a pkg process is running and holds the package lock; wait for it or stop it"
                .to_string(),
        ));
    }
    executor.log().warn("Found an orphaned package lock");
    Ok(true)
}
