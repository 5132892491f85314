use anyhow::anyhow;

use fwstage_core::{RunLog, StageId, UpgradeError, UpgradeResult, UpgradeState};

use crate::StateStore;

/// Classified result of one stage's work.
#[derive(Debug)]
pub enum StageVerdict {
    Passed,
    Failed(UpgradeError),
}

/// Ordered stage progression over the checkpoint.
///
/// The checkpoint moves forward only after a stage passes, so a crash between a stage's
/// commands and its commit replays that stage from the start. A non-durable machine (dry-run)
/// tracks progress in memory and never touches the store.
pub struct StageMachine<'a> {
    store: &'a StateStore,
    log: &'a RunLog,
    state: UpgradeState,
    durable: bool,
    created: bool,
}

impl<'a> StageMachine<'a> {
    /// A new run. A durable run claims the checkpoint before any stage work, and fails if
    /// another run already holds it.
    pub fn start(
        store: &'a StateStore,
        log: &'a RunLog,
        state: UpgradeState,
        durable: bool,
    ) -> UpgradeResult<Self> {
        if durable {
            store.claim(&state)?;
            log.info(&format!(
                "State saved: {}, target {}",
                state.stage, state.target
            ));
        }
        Ok(Self {
            store,
            log,
            state,
            durable,
            created: durable,
        })
    }

    /// A run continuing from a checkpoint already on disk.
    pub fn resume(store: &'a StateStore, log: &'a RunLog, state: UpgradeState, durable: bool) -> Self {
        Self {
            store,
            log,
            state,
            durable,
            created: false,
        }
    }

    pub fn current(&self) -> StageId {
        self.state.stage
    }

    pub fn state(&self) -> &UpgradeState {
        &self.state
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Commits the move past `stage`. Only the current stage may advance, and a failed verdict
    /// leaves the checkpoint where it was and hands the failure back. A failed PRECHECK of a
    /// run that claimed the checkpoint itself removes it instead.
    pub fn advance(&mut self, stage: StageId, verdict: StageVerdict) -> UpgradeResult<StageId> {
        if stage != self.state.stage {
            return Err(UpgradeError::Other(anyhow!(
                "cannot advance {stage}: run is at {}",
                self.state.stage
            )));
        }
        if let StageVerdict::Failed(err) = verdict {
            // PRECHECK failures leave the host untouched; drop a claim this run made.
            if stage == StageId::Precheck && self.created {
                self.store.clear()?;
                self.created = false;
                self.log
                    .error(&format!("{stage} failed; upgrade state cleared"));
                return Err(err);
            }
            self.log
                .error(&format!("{stage} failed; checkpoint stays at {stage}"));
            return Err(err);
        }

        let next = stage.next_for(self.state.minor_only).unwrap_or(StageId::Done);
        let updated = self.state.with_stage(next);
        if self.durable {
            self.store.save(&updated)?;
            self.log
                .info(&format!("State saved: {next}, target {}", updated.target));
        } else {
            self.log.info(&format!(
                "[DRY RUN] State checkpoint: {next}, target {}",
                updated.target
            ));
        }
        self.state = updated;
        Ok(next)
    }

    /// Removes the checkpoint once every stage has passed.
    pub fn complete(&mut self) -> UpgradeResult<()> {
        if self.state.stage != StageId::Done {
            return Err(UpgradeError::Other(anyhow!(
                "cannot complete a run that is still at {}",
                self.state.stage
            )));
        }
        if self.durable {
            self.store.clear()?;
            self.log.info("Upgrade state cleared");
        }
        Ok(())
    }

    /// Drops the checkpoint after an operator cancel, but only one this run created.
    /// Returns whether it was removed.
    pub fn abandon(&mut self) -> UpgradeResult<bool> {
        if !self.created {
            return Ok(false);
        }
        let removed = self.store.clear()?;
        self.created = false;
        if removed {
            self.log.info("Upgrade state cleared");
        }
        Ok(removed)
    }
}
