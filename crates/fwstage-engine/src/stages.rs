use std::fs;
use std::io;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

use fwstage_core::{
    Branch, Executor, FailurePolicy, HostLayout, StageId, UpgradeConfig, UpgradeError,
    UpgradeResult, UpgradeState,
};
use fwstage_oracle::{abi_mismatch, freebsd_release, service_running, VersionOracle};

use crate::backup::create_backup;
use crate::confirm::ConfirmGate;
use crate::preflight::{check_pkg_lock, PKG_CHECK_COMMAND};

/// What the driver does after a stage's work succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFlow {
    Continue,
    /// Commit the checkpoint, then reboot into the next stage.
    Reboot(String),
    /// The operator declined a confirmation inside the stage.
    Cancelled,
}

pub(crate) struct StageContext<'r> {
    pub executor: &'r Executor<'r>,
    pub oracle: &'r VersionOracle<'r>,
    pub layout: &'r HostLayout,
    pub config: &'r UpgradeConfig,
    pub gate: &'r ConfirmGate<'r>,
}

/// Runs one stage's work. Every stage starts over from its first command when replayed.
pub(crate) fn run_stage(
    ctx: &StageContext<'_>,
    state: &UpgradeState,
    stage: StageId,
) -> UpgradeResult<StageFlow> {
    match stage {
        StageId::Precheck => precheck(ctx),
        StageId::Cleanup => cleanup(ctx),
        StageId::Backup => backup(ctx),
        StageId::BaseKernel => base_kernel(ctx, state),
        StageId::FixPkg => fix_pkg(ctx),
        StageId::Packages => packages(ctx, state),
        StageId::Verify => verify(ctx, state),
        StageId::Done => Ok(StageFlow::Continue),
    }
}

fn precheck(ctx: &StageContext<'_>) -> UpgradeResult<StageFlow> {
    let executor = ctx.executor;
    let log = executor.log();

    if check_pkg_lock(executor, ctx.layout)? {
        let lock = ctx.layout.pkg_lock_path();
        executor.run_with(
            &format!("rm -f {}", lock.display()),
            FailurePolicy::Strict,
        )?;
        log.success("Removed orphaned package lock");
    }

    let obsolete = executor
        .inspect("pkg query '%n' | grep '^py37-'")
        .map(|listing| {
            listing
                .lines()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if obsolete.is_empty() {
        log.success("No obsolete Python 3.7 packages installed");
        return Ok(StageFlow::Continue);
    }

    log.warn(&format!(
        "Found {} obsolete Python 3.7 package(s): {}",
        obsolete.len(),
        obsolete.join(", ")
    ));
    if ctx.gate.ask("Remove obsolete py37 packages?") {
        for package in &obsolete {
            executor.run_with(
                &format!("pkg delete -fy {package}"),
                FailurePolicy::BestEffort,
            )?;
        }
    } else {
        log.warn("Keeping obsolete py37 packages; they may conflict with the upgrade");
    }
    Ok(StageFlow::Continue)
}

fn cleanup(ctx: &StageContext<'_>) -> UpgradeResult<StageFlow> {
    let executor = ctx.executor;
    executor.run_with("pkg autoremove -y", FailurePolicy::BestEffort)?;
    executor.run_with("pkg clean -ay", FailurePolicy::BestEffort)?;
    let [tmp, var_tmp] = ctx.layout.scratch_dirs();
    executor.run_with(
        &format!("rm -rf {}/* {}/*", tmp.display(), var_tmp.display()),
        FailurePolicy::BestEffort,
    )?;
    executor.log().success("Cleanup completed");
    Ok(StageFlow::Continue)
}

fn backup(ctx: &StageContext<'_>) -> UpgradeResult<StageFlow> {
    let log = ctx.executor.log();
    let summary = create_backup(ctx.executor, ctx.layout)?;
    match summary.config_sha256 {
        Some(digest) => log.success(&format!(
            "Configuration backed up to {} (sha256 {digest})",
            summary.config_copy.display()
        )),
        None => log.info(&format!(
            "Configuration backup planned at {}",
            summary.config_copy.display()
        )),
    }
    Ok(StageFlow::Continue)
}

fn base_kernel(ctx: &StageContext<'_>, state: &UpgradeState) -> UpgradeResult<StageFlow> {
    let executor = ctx.executor;
    let log = executor.log();

    if state.minor_only {
        let result = executor.run_with("opnsense-update -bk", FailurePolicy::BestEffort)?;
        if result
            .combined_output()
            .to_ascii_lowercase()
            .contains("please reboot")
        {
            return Ok(StageFlow::Reboot(
                "base/kernel update requires a reboot".to_string(),
            ));
        }
        log.info("Base/kernel update did not ask for a reboot");
        return Ok(StageFlow::Continue);
    }

    log.warn(&format!(
        "Replacing base system and kernel for {}; the host reboots afterwards",
        state.target
    ));
    if !ctx.gate.ask("Proceed with base/kernel upgrade?") {
        return Ok(StageFlow::Cancelled);
    }
    executor.run_with("opnsense-update -ubkf", FailurePolicy::Strict)?;
    log.success("Base system and kernel upgraded");
    Ok(StageFlow::Reboot(format!(
        "base/kernel upgraded for {}",
        state.target
    )))
}

fn fix_pkg(ctx: &StageContext<'_>) -> UpgradeResult<StageFlow> {
    let executor = ctx.executor;
    let log = executor.log();

    if let Some(mismatch) = abi_mismatch(executor) {
        log.warn(&format!(
            "ABI mismatch: base is FreeBSD {} but pkg was built for FreeBSD {}",
            mismatch.base_major, mismatch.pkg_major
        ));
    }

    let healthy = executor.check("pkg -v") && executor.check("pkg query '%n' opnsense");
    if healthy {
        log.success("Package manager is functional");
    } else {
        log.warn("Package manager is broken, reinstalling pkg");
        executor.run_with("pkg-static install -fy pkg", FailurePolicy::BestEffort)?;
        if !executor.is_dry_run() && !executor.check("pkg -v") {
            log.warn("pkg is still broken, bootstrapping");
            executor.run_with("opnsense-bootstrap -y", FailurePolicy::Strict)?;
        }
    }

    // pkg must match the new base ABI even when it still starts.
    executor.run_with("pkg-static install -fy pkg", FailurePolicy::BestEffort)?;
    log.success("Package manager reinstalled for the new base");
    Ok(StageFlow::Continue)
}

fn packages(ctx: &StageContext<'_>, state: &UpgradeState) -> UpgradeResult<StageFlow> {
    let executor = ctx.executor;
    let log = executor.log();
    let target = state.target;

    if state.minor_only {
        // A failed update check says nothing about progress; only the installed version counts.
        let settled = || {
            ctx.oracle
                .installed_version()
                .is_some_and(|version| target.is_reached_by(&version))
        };
        executor.run_with("opnsense-update -p", FailurePolicy::Recheck(&settled))?;
        log.success("Packages updated");
        return Ok(StageFlow::Continue);
    }

    let branch = target.branch();
    switch_repository(executor, ctx.layout, branch)?;
    executor.run_with("pkg update -f", FailurePolicy::BestEffort)?;
    executor.run_with("pkg upgrade -fy", FailurePolicy::BestEffort)?;
    let on_branch = || {
        ctx.oracle
            .installed_version()
            .is_some_and(|version| version.branch() == branch)
    };
    executor.run_with("opnsense-update", FailurePolicy::Recheck(&on_branch))?;

    if executor.is_dry_run() {
        return Ok(StageFlow::Continue);
    }
    match ctx.oracle.installed_version() {
        Some(version) if version.branch() == branch => {
            log.success(&format!("Packages upgraded to {version}"));
            Ok(StageFlow::Continue)
        }
        Some(version) => Err(UpgradeError::Other(anyhow!(
            "package upgrade finished but the system is still on {version}, expected branch {branch}"
        ))),
        None => Err(UpgradeError::Other(anyhow!(
            "unable to read the installed version after the package upgrade"
        ))),
    }
}

/// Points every branch path in the pkg repository config at `branch`. No-op once switched.
pub(crate) fn switch_repository(
    executor: &Executor<'_>,
    layout: &HostLayout,
    branch: Branch,
) -> Result<()> {
    let path = layout.pkg_repo_conf_path();
    let current = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            bail!("package repository config not found: {}", path.display())
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let pattern = Regex::new(r"/\d{2}\.\d+/").context("invalid branch path pattern")?;
    let marker = format!("/{branch}/");
    let rewritten = pattern.replace_all(&current, marker.as_str()).into_owned();
    if rewritten == current {
        executor
            .log()
            .info(&format!("Package repository already points at {branch}"));
        return Ok(());
    }

    executor.perform(
        &format!("point {} at branch {branch}", path.display()),
        || {
            fs::write(&path, &rewritten)
                .with_context(|| format!("failed to write {}", path.display()))
        },
    )?;
    executor
        .log()
        .success(&format!("Package repository switched to {branch}"));
    Ok(())
}

fn verify(ctx: &StageContext<'_>, state: &UpgradeState) -> UpgradeResult<StageFlow> {
    let executor = ctx.executor;
    let log = executor.log();

    match ctx.oracle.installed_version() {
        Some(version) if state.target.is_reached_by(&version) => {
            log.success(&format!("Installed version: {version}"))
        }
        Some(version) if executor.is_dry_run() => log.warn(&format!(
            "Installed version {version} has not reached target {} yet",
            state.target
        )),
        Some(version) => {
            return Err(UpgradeError::Other(anyhow!(
                "installed version {version} has not reached target {}",
                state.target
            )))
        }
        None if executor.is_dry_run() => log.warn("Unable to read the installed version"),
        None => {
            return Err(UpgradeError::Other(anyhow!(
                "unable to read the installed version to verify target {}",
                state.target
            )))
        }
    }
    if let Some(release) = freebsd_release(executor) {
        log.info(&format!("FreeBSD release: {release}"));
    }

    executor.run_with(PKG_CHECK_COMMAND, FailurePolicy::BestEffort)?;

    for service in &ctx.config.critical_services {
        if service_running(executor, service) {
            log.success(&format!("{service} is running"));
        } else {
            log.warn(&format!("{service} is not running"));
        }
    }
    Ok(StageFlow::Continue)
}
