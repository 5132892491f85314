use fwstage_core::RunLog;

/// Operator confirmation before a mutating step.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Answers every prompt with yes; for non-interactive callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Force mode and dry-run never ask.
pub(crate) struct ConfirmGate<'a> {
    confirm: &'a dyn Confirm,
    bypass: bool,
    log: &'a RunLog,
}

impl<'a> ConfirmGate<'a> {
    pub(crate) fn new(confirm: &'a dyn Confirm, bypass: bool, log: &'a RunLog) -> Self {
        Self {
            confirm,
            bypass,
            log,
        }
    }

    pub(crate) fn ask(&self, prompt: &str) -> bool {
        if self.bypass {
            return true;
        }
        let accepted = self.confirm.confirm(prompt);
        self.log.info(&format!(
            "{prompt} {}",
            if accepted { "[yes]" } else { "[no]" }
        ));
        accepted
    }
}
