use fwstage_core::{UpgradeResult, VersionTarget};

use crate::orchestrator::{Orchestrator, Outcome, RunRequest, StatusReport, TargetSpec};
use crate::preflight::ensure_no_active_run;
use crate::StateStore;

/// Entry points for a remote control plane. Triggers run unattended in execute mode and are
/// refused while any checkpoint, readable or not, is on disk.
pub struct ControlSurface<'o, 'a> {
    orchestrator: &'o Orchestrator<'a>,
}

impl<'o, 'a> ControlSurface<'o, 'a> {
    pub fn new(orchestrator: &'o Orchestrator<'a>) -> Self {
        Self { orchestrator }
    }

    pub fn status(&self) -> UpgradeResult<StatusReport> {
        self.orchestrator.status()
    }

    pub fn trigger_minor(&self) -> UpgradeResult<Outcome> {
        self.ensure_idle()?;
        self.orchestrator.run(RunRequest {
            target: None,
            minor: true,
            execute: true,
            force: true,
        })
    }

    /// `None` picks the newest branch on the mirror.
    pub fn trigger_major(&self, target: Option<VersionTarget>) -> UpgradeResult<Outcome> {
        self.ensure_idle()?;
        self.orchestrator.run(RunRequest {
            target: Some(target.map_or(TargetSpec::Auto, TargetSpec::Version)),
            minor: false,
            execute: true,
            force: true,
        })
    }

    pub fn trigger_reboot(&self) -> UpgradeResult<()> {
        self.ensure_idle()?;
        self.orchestrator.reboot("reboot requested by the control plane")
    }

    fn ensure_idle(&self) -> UpgradeResult<()> {
        ensure_no_active_run(&StateStore::new(self.orchestrator.layout()))
    }
}
