use std::path::PathBuf;

use anyhow::anyhow;

use fwstage_core::{
    CommandRunner, Executor, FailurePolicy, HostLayout, RunLog, StageId, UpgradeConfig,
    UpgradeError, UpgradeResult, UpgradeState, VersionInfo, VersionTarget,
};
use fwstage_oracle::{
    abi_mismatch, assess_reboot, resolve_mirror_url, update_pending, uptime_secs, MirrorClient,
    ProbeContext, RebootAssessment, VersionOracle, VersionSurvey,
};

use crate::backup::{create_backup, BackupSummary};
use crate::confirm::{Confirm, ConfirmGate};
use crate::machine::{StageMachine, StageVerdict};
use crate::preflight::{
    check_disk_space, check_package_database, check_pkg_lock, ensure_no_active_run,
};
use crate::resume::{escape_single_quote_shell, ResumeScheduler};
use crate::stages::{run_stage, StageContext, StageFlow};
use crate::store::{read_completion_record, write_completion_record, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSpec {
    /// Pick the newest branch the mirror offers.
    Auto,
    Version(VersionTarget),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunRequest {
    pub target: Option<TargetSpec>,
    pub minor: bool,
    pub execute: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumeRequest {
    pub execute: bool,
    pub force: bool,
    /// Overrides the completion record when deciding whether a past upgrade already finished.
    pub target: Option<VersionTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed {
        target: VersionTarget,
        version: Option<VersionInfo>,
    },
    DryRunComplete {
        planned: Vec<String>,
    },
    RebootPending {
        next: StageId,
    },
    AlreadyCurrent(VersionInfo),
    MinorOnlyAvailable {
        current: VersionInfo,
        minor: VersionInfo,
    },
    NothingToResume,
    Cancelled,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Cancelled => 1,
            _ => 0,
        }
    }
}

/// Where a run without a checkpoint should pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    Stage(StageId),
    /// The recorded target is already installed.
    Done(VersionInfo),
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointStatus {
    Absent,
    Present(UpgradeState),
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub checkpoint: CheckpointStatus,
    pub hook_installed: bool,
    pub survey: Result<VersionSurvey, String>,
    pub reboot: Option<RebootAssessment>,
    pub reboot_required_flag: bool,
    pub last_target: Option<VersionTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanReport {
    pub state_removed: bool,
    pub hook_removed: bool,
}

enum Plan {
    Run {
        target: VersionTarget,
        minor_only: bool,
    },
    Finish(Outcome),
}

/// Drives whole upgrade runs: gates, stage sequencing, reboots and completion.
pub struct Orchestrator<'a> {
    config: &'a UpgradeConfig,
    layout: HostLayout,
    runner: &'a dyn CommandRunner,
    mirror_client: &'a dyn MirrorClient,
    confirm: &'a dyn Confirm,
    log: &'a RunLog,
    resume_program: PathBuf,
    resume_args: Vec<String>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a UpgradeConfig,
        runner: &'a dyn CommandRunner,
        mirror_client: &'a dyn MirrorClient,
        confirm: &'a dyn Confirm,
        log: &'a RunLog,
    ) -> Self {
        Self {
            config,
            layout: config.layout(),
            runner,
            mirror_client,
            confirm,
            log,
            resume_program: PathBuf::from("/usr/local/sbin/fwstage"),
            resume_args: Vec::new(),
        }
    }

    /// Command the boot hook runs after a reboot; `-x -r` is always added.
    pub fn with_resume_command(mut self, program: PathBuf, extra_args: Vec<String>) -> Self {
        self.resume_program = program;
        self.resume_args = extra_args;
        self
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn log(&self) -> &RunLog {
        self.log
    }

    fn scheduler(&self) -> ResumeScheduler {
        ResumeScheduler::new(&self.layout, self.config.resume_settle_secs)
    }

    fn session<T>(
        &self,
        dry_run: bool,
        body: impl FnOnce(&Executor<'_>, &VersionOracle<'_>) -> UpgradeResult<T>,
    ) -> UpgradeResult<T> {
        let executor = Executor::new(self.runner, self.log, dry_run);
        let mirror_url =
            resolve_mirror_url(&executor, &self.layout, self.config.mirror_url.as_deref());
        tracing::debug!(%mirror_url, dry_run, "session started");
        let oracle = VersionOracle::new(ProbeContext::new(
            &executor,
            &self.layout,
            self.mirror_client,
            mirror_url,
        ));
        body(&executor, &oracle)
    }

    pub fn list_versions(&self) -> UpgradeResult<VersionSurvey> {
        self.session(false, |_, oracle| {
            self.log.section("Version survey");
            let survey = oracle.survey()?;
            match (&survey.minor, &survey.major) {
                (Some(minor), Some(major)) => self.log.warn(&format!(
                    "Minor update {} and major upgrade {} are both available; apply minor updates first",
                    minor.version, major.version
                )),
                (None, None) => self.log.success("System is up to date"),
                _ => {}
            }
            Ok(survey)
        })
    }

    /// Starts a fresh run. Refuses while a checkpoint exists.
    pub fn run(&self, request: RunRequest) -> UpgradeResult<Outcome> {
        let store = StateStore::new(&self.layout);
        ensure_no_active_run(&store)?;
        let dry_run = !request.execute;
        if dry_run {
            self.log
                .warn("DRY RUN: no changes will be made (use -x to execute)");
        }

        self.session(dry_run, |executor, oracle| {
            self.log.section("Pre-flight checks");
            let current = oracle.resolve_current()?.version;
            let (target, minor_only) = match self.plan_target(oracle, &current, &request)? {
                Plan::Run { target, minor_only } => (target, minor_only),
                Plan::Finish(outcome) => return Ok(outcome),
            };

            if !minor_only {
                if let Some(minor) = oracle.resolve_minor_candidate(&current) {
                    return Err(UpgradeError::SafetyGateBlocked(format!(
                        "a minor update to {} is pending on {}; apply it with -m before a major upgrade",
                        minor.version,
                        current.branch()
                    )));
                }
            }
            let branch = target.branch();
            if !oracle.branch_on_mirror(branch) {
                return Err(UpgradeError::PreflightFailure(format!(
                    "branch {branch} is not available on the package mirror"
                )));
            }
            check_disk_space(executor, self.config.min_free_mb)?;
            check_package_database(executor)?;
            check_pkg_lock(executor, &self.layout)?;

            let gate = ConfirmGate::new(self.confirm, dry_run || request.force, self.log);
            let kind = if minor_only { "minor update" } else { "major upgrade" };
            if !gate.ask(&format!("Start {kind} from {current} to {target}?")) {
                self.log.warn("Upgrade cancelled");
                return Ok(Outcome::Cancelled);
            }

            let state = UpgradeState::new(
                StageId::Precheck,
                target,
                minor_only,
                request.force,
                self.log.path().to_path_buf(),
            );
            let machine = StageMachine::start(&store, self.log, state, !dry_run)?;
            self.drive(executor, oracle, machine, &gate)
        })
    }

    fn plan_target(
        &self,
        oracle: &VersionOracle<'_>,
        current: &VersionInfo,
        request: &RunRequest,
    ) -> UpgradeResult<Plan> {
        match (request.minor, request.target) {
            (true, Some(TargetSpec::Version(target))) if target.branch() != current.branch() => {
                Err(UpgradeError::SafetyGateBlocked(format!(
                    "-m only updates within branch {}; {target} is on another branch, use -t",
                    current.branch()
                )))
            }
            (_, Some(TargetSpec::Version(target))) => {
                if target.is_reached_by(current) {
                    self.log
                        .success(&format!("Already on version {current} (target {target})"));
                    return Ok(Plan::Finish(Outcome::AlreadyCurrent(*current)));
                }
                if target.version < *current {
                    return Err(UpgradeError::SafetyGateBlocked(format!(
                        "target {target} is older than the installed {current}"
                    )));
                }
                let minor_only = target.branch() == current.branch();
                if minor_only && !request.minor {
                    self.log.info(&format!(
                        "Target {target} is on the current branch; using the minor update path"
                    ));
                }
                Ok(Plan::Run { target, minor_only })
            }
            (true, _) => match oracle.resolve_minor_candidate(current) {
                Some(minor) => Ok(Plan::Run {
                    target: VersionTarget::from_version(minor.version),
                    minor_only: true,
                }),
                None => {
                    self.log.success(&format!("No minor updates available for {current}"));
                    Ok(Plan::Finish(Outcome::AlreadyCurrent(*current)))
                }
            },
            (false, Some(TargetSpec::Auto)) => {
                if let Some(major) = oracle.resolve_major_candidate(current) {
                    self.log
                        .info(&format!("Auto-detected target version: {}", major.version));
                    return Ok(Plan::Run {
                        target: VersionTarget::from_version(major.version),
                        minor_only: false,
                    });
                }
                if let Some(minor) = oracle.resolve_minor_candidate(current) {
                    self.log.warn(&format!(
                        "No major upgrade available, but minor update {} is; run with -m",
                        minor.version
                    ));
                    return Ok(Plan::Finish(Outcome::MinorOnlyAvailable {
                        current: *current,
                        minor: minor.version,
                    }));
                }
                self.log.success("System is up to date");
                Ok(Plan::Finish(Outcome::AlreadyCurrent(*current)))
            }
            (false, None) => Err(UpgradeError::Other(anyhow!(
                "choose -m for a minor update or -t for a major upgrade"
            ))),
        }
    }

    /// Continues from the checkpoint, or works out from the host where a past run stopped.
    pub fn resume(&self, request: ResumeRequest) -> UpgradeResult<Outcome> {
        let store = StateStore::new(&self.layout);
        let existing = store.load()?;
        let dry_run = !request.execute;

        self.session(dry_run, |executor, oracle| {
            let scheduler = self.scheduler();
            if let Some(state) = existing {
                self.log.section("Resuming upgrade");
                self.log.info(&format!(
                    "Resuming {} to {} at {}",
                    if state.minor_only { "minor update" } else { "major upgrade" },
                    state.target,
                    state.stage
                ));
                let gate = ConfirmGate::new(
                    self.confirm,
                    dry_run || state.force_mode || request.force,
                    self.log,
                );
                let machine = StageMachine::resume(&store, self.log, state, !dry_run);
                return self.drive(executor, oracle, machine, &gate);
            }

            self.log.info("No checkpoint found; inspecting the host");
            let recorded = match request.target {
                Some(target) => Some(target),
                None => read_completion_record(&self.layout)?,
            };
            match detect_resume_point(executor, oracle, recorded.as_ref()) {
                ResumePoint::Nothing => {
                    if !dry_run && scheduler.remove()? {
                        self.log.info("Removed stale resume hook");
                    }
                    self.log.info("Nothing to resume");
                    Ok(Outcome::NothingToResume)
                }
                ResumePoint::Done(version) => {
                    if !dry_run {
                        scheduler.remove()?;
                    }
                    self.log
                        .success(&format!("Upgrade already complete: running {version}"));
                    Ok(Outcome::AlreadyCurrent(version))
                }
                ResumePoint::Stage(stage) => {
                    let current = oracle.resolve_current()?.version;
                    let (target, minor_only) =
                        resume_target(oracle, &current, stage, request.target)?;
                    self.log.info(&format!(
                        "Resuming at {stage} toward {target} from detected host state"
                    ));

                    self.log.section("Pre-flight checks");
                    check_disk_space(executor, self.config.min_free_mb)?;
                    // pkg cannot check its database while its ABI lags the new base.
                    if stage != StageId::FixPkg {
                        check_package_database(executor)?;
                    }
                    check_pkg_lock(executor, &self.layout)?;

                    let gate =
                        ConfirmGate::new(self.confirm, dry_run || request.force, self.log);
                    let kind = if minor_only { "minor update" } else { "major upgrade" };
                    if !gate.ask(&format!("Resume {kind} to {target} at {stage}?")) {
                        self.log.warn("Upgrade cancelled");
                        return Ok(Outcome::Cancelled);
                    }
                    let state = UpgradeState::new(
                        stage,
                        target,
                        minor_only,
                        request.force,
                        self.log.path().to_path_buf(),
                    );
                    let machine = StageMachine::start(&store, self.log, state, !dry_run)?;
                    self.drive(executor, oracle, machine, &gate)
                }
            }
        })
    }

    fn drive(
        &self,
        executor: &Executor<'_>,
        oracle: &VersionOracle<'_>,
        mut machine: StageMachine<'_>,
        gate: &ConfirmGate<'_>,
    ) -> UpgradeResult<Outcome> {
        let scheduler = self.scheduler();
        let ctx = StageContext {
            executor,
            oracle,
            layout: &self.layout,
            config: self.config,
            gate,
        };

        while machine.current() != StageId::Done {
            let stage = machine.current();
            self.log
                .section(&format!("Stage {}: {}", stage.code(), stage.name()));
            let (verdict, flow) = match run_stage(&ctx, machine.state(), stage) {
                Ok(flow) => (StageVerdict::Passed, flow),
                Err(err) => (StageVerdict::Failed(err), StageFlow::Continue),
            };
            if flow == StageFlow::Cancelled {
                if !machine.abandon()? {
                    self.log.info(&format!(
                        "Checkpoint kept at {stage}; resume with -r or discard it with -c"
                    ));
                }
                self.log.warn("Upgrade cancelled by operator");
                return Ok(Outcome::Cancelled);
            }

            let next = machine.advance(stage, verdict)?;
            if let StageFlow::Reboot(reason) = flow {
                if executor.is_dry_run() {
                    self.log
                        .info(&format!("would set up auto-resume and reboot ({reason})"));
                    continue;
                }
                return self.suspend_for_reboot(executor, &scheduler, gate, next, &reason);
            }
        }

        if executor.is_dry_run() {
            let planned = executor.planned_commands();
            self.log.section("Dry run summary");
            self.log
                .info(&format!("{} mutating step(s) planned", planned.len()));
            for (index, step) in planned.iter().enumerate() {
                self.log.info(&format!("  {}. {step}", index + 1));
            }
            return Ok(Outcome::DryRunComplete { planned });
        }

        let target = machine.state().target;
        write_completion_record(&self.layout, &target)?;
        machine.complete()?;
        if scheduler.remove()? {
            self.log.info("Auto-resume hook removed");
        }
        let version = oracle.installed_version();
        self.log.success(&format!(
            "Upgrade complete: {}",
            version
                .map(|version| version.to_string())
                .unwrap_or_else(|| target.to_string())
        ));

        if self.layout.reboot_required_path().exists() {
            self.log.warn("The system reports that a reboot is required");
            if gate.ask("Reboot now to finish?") {
                reboot_with(executor, "upgrade complete")?;
            } else {
                self.log.info("Reboot later to finish applying the update");
            }
        }
        Ok(Outcome::Completed { target, version })
    }

    fn suspend_for_reboot(
        &self,
        executor: &Executor<'_>,
        scheduler: &ResumeScheduler,
        gate: &ConfirmGate<'_>,
        next: StageId,
        reason: &str,
    ) -> UpgradeResult<Outcome> {
        self.log.section("Reboot required");
        let hook = scheduler.install(&self.resume_program, &self.resume_args)?;
        self.log
            .success(&format!("Auto-resume hook installed at {}", hook.display()));
        self.log.info(&format!(
            "After the reboot the upgrade continues at {next}; progress goes to {}",
            scheduler.resume_log_path().display()
        ));
        if gate.ask("Reboot now?") {
            reboot_with(executor, reason)?;
        } else {
            self.log
                .warn("Reboot manually to continue; the upgrade resumes automatically");
        }
        Ok(Outcome::RebootPending { next })
    }

    /// Removes the checkpoint and the resume hook, including a checkpoint that no longer parses.
    pub fn clean(&self) -> UpgradeResult<CleanReport> {
        let state_removed = StateStore::new(&self.layout).clear()?;
        let hook_removed = self.scheduler().remove()?;
        if state_removed {
            self.log.success("Upgrade state cleared");
        }
        if hook_removed {
            self.log.success("Auto-resume hook removed");
        }
        if !state_removed && !hook_removed {
            self.log.info("Nothing to clean");
        }
        Ok(CleanReport {
            state_removed,
            hook_removed,
        })
    }

    /// Standalone backup. Non-destructive, so it always writes.
    pub fn backup(&self) -> UpgradeResult<BackupSummary> {
        self.session(false, |executor, _| {
            self.log.section("Backup");
            let summary = create_backup(executor, &self.layout)?;
            self.log.success(&format!(
                "Configuration backed up to {}",
                summary.config_copy.display()
            ));
            self.log.success(&format!(
                "Package list saved to {}",
                summary.package_list.display()
            ));
            Ok(summary)
        })
    }

    pub fn status(&self) -> UpgradeResult<StatusReport> {
        let store = StateStore::new(&self.layout);
        let checkpoint = match store.load() {
            Ok(Some(state)) => CheckpointStatus::Present(state),
            Ok(None) => CheckpointStatus::Absent,
            Err(UpgradeError::StateCorruption { reason, .. }) => CheckpointStatus::Corrupt(reason),
            Err(err) => return Err(err),
        };
        let last_target = match read_completion_record(&self.layout) {
            Ok(target) => target,
            Err(err) => {
                self.log
                    .warn(&format!("Ignoring unreadable completion record: {err:#}"));
                None
            }
        };

        self.session(false, |executor, oracle| {
            let survey = oracle.survey().map_err(|err| err.to_string());
            let reboot = oracle.context().firmware().map(|report| {
                let now = chrono::Utc::now().timestamp();
                assess_reboot(
                    report,
                    uptime_secs(executor, now),
                    chrono::Local::now().naive_local(),
                )
            });
            Ok(StatusReport {
                checkpoint,
                hook_installed: self.scheduler().is_installed(),
                survey,
                reboot,
                reboot_required_flag: self.layout.reboot_required_path().exists(),
                last_target,
            })
        })
    }

    /// Reboots the host now.
    pub fn reboot(&self, reason: &str) -> UpgradeResult<()> {
        let executor = Executor::new(self.runner, self.log, false);
        reboot_with(&executor, reason)
    }
}

fn reboot_with(executor: &Executor<'_>, reason: &str) -> UpgradeResult<()> {
    executor.log().warn(&format!("Rebooting: {reason}"));
    executor.run_with(
        &format!(
            "/sbin/shutdown -r now '{}'",
            escape_single_quote_shell(reason)
        ),
        FailurePolicy::Strict,
    )?;
    Ok(())
}

/// Resume point from host state alone: ABI mismatch, then a pending update, then the
/// recorded target already installed.
pub fn detect_resume_point(
    executor: &Executor<'_>,
    oracle: &VersionOracle<'_>,
    recorded: Option<&VersionTarget>,
) -> ResumePoint {
    let log = executor.log();
    if let Some(mismatch) = abi_mismatch(executor) {
        log.warn(&format!(
            "ABI mismatch: base is FreeBSD {} but pkg expects FreeBSD {}",
            mismatch.base_major, mismatch.pkg_major
        ));
        return ResumePoint::Stage(StageId::FixPkg);
    }
    if update_pending(executor) {
        log.info("Updates are pending");
        return ResumePoint::Stage(StageId::BaseKernel);
    }
    if let Some(recorded) = recorded {
        if let Some(current) = oracle.installed_version() {
            if recorded.is_reached_by(&current) {
                return ResumePoint::Done(current);
            }
        }
    }
    ResumePoint::Nothing
}

/// Target and path for a resume point found without a checkpoint. FIX_PKG only exists on
/// the major path.
fn resume_target(
    oracle: &VersionOracle<'_>,
    current: &VersionInfo,
    stage: StageId,
    given: Option<VersionTarget>,
) -> UpgradeResult<(VersionTarget, bool)> {
    let major_path = stage == StageId::FixPkg;
    if let Some(target) = given {
        return Ok((target, !major_path && target.branch() == current.branch()));
    }
    if !major_path {
        if let Some(minor) = oracle.resolve_minor_candidate(current) {
            return Ok((VersionTarget::from_version(minor.version), true));
        }
    }
    if let Some(major) = oracle.resolve_major_candidate(current) {
        return Ok((VersionTarget::from_version(major.version), false));
    }
    Err(UpgradeError::VersionUnresolvable(format!(
        "cannot tell which version to resume toward from {current}; pass it with -t"
    )))
}
