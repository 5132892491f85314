use std::cell::RefCell;
use std::time::Duration;

use anyhow::Result;

use crate::{CommandResult, CommandRunner, RunLog, UpgradeError};

/// How a non-zero exit from a mutating command is judged.
pub enum FailurePolicy<'c> {
    /// Non-zero fails the step.
    Strict,
    /// Non-zero is logged as a warning and the step continues.
    BestEffort,
    /// Non-zero is only a failure when the post-hoc check says the expected state is missing.
    Recheck(&'c dyn Fn() -> bool),
}

/// Funnel for every external command a run issues.
pub struct Executor<'a> {
    runner: &'a dyn CommandRunner,
    log: &'a RunLog,
    dry_run: bool,
    planned: RefCell<Vec<String>>,
}

impl<'a> Executor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, log: &'a RunLog, dry_run: bool) -> Self {
        Self {
            runner,
            log,
            dry_run,
            planned: RefCell::new(Vec::new()),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn log(&self) -> &'a RunLog {
        self.log
    }

    /// Mutating commands requested so far, whether or not they actually ran.
    pub fn planned_commands(&self) -> Vec<String> {
        self.planned.borrow().clone()
    }

    pub fn run(&self, command: &str, mutating: bool) -> Result<CommandResult> {
        if mutating {
            self.planned.borrow_mut().push(command.to_string());
            if self.dry_run {
                self.log.info(&format!("would run: {command}"));
                return Ok(CommandResult::success(""));
            }
            self.log.info(&format!("Running: {command}"));
        }

        let result = self.runner.run(command)?;
        if mutating {
            self.log.append_raw(&result.combined_output());
            self.log.info(&format!(
                "exit {} after {}",
                result.exit_code,
                format_duration(result.duration)
            ));
        }
        Ok(result)
    }

    /// A mutating step done in-process rather than by a command. Skipped in dry-run.
    pub fn perform<T>(
        &self,
        description: &str,
        action: impl FnOnce() -> Result<T>,
    ) -> Result<Option<T>> {
        self.planned.borrow_mut().push(description.to_string());
        if self.dry_run {
            self.log.info(&format!("would {description}"));
            return Ok(None);
        }
        action().map(Some)
    }

    /// Runs a mutating command and applies `policy` to its exit status.
    pub fn run_with(&self, command: &str, policy: FailurePolicy<'_>) -> Result<CommandResult> {
        let result = self.run(command, true)?;
        if result.succeeded() {
            return Ok(result);
        }

        match policy {
            FailurePolicy::Strict => Err(UpgradeError::CommandFailure {
                command: command.to_string(),
                result,
            }
            .into()),
            FailurePolicy::BestEffort => {
                self.log.warn(&format!(
                    "{command} reported errors (exit {}), continuing",
                    result.exit_code
                ));
                Ok(result)
            }
            FailurePolicy::Recheck(check) => {
                if check() {
                    self.log.warn(&format!(
                        "{command} exited {} but the installed state is as expected",
                        result.exit_code
                    ));
                    Ok(result)
                } else {
                    Err(UpgradeError::CommandFailure {
                        command: command.to_string(),
                        result,
                    }
                    .into())
                }
            }
        }
    }

    /// Read-only probe. Runs even in dry-run; any failure or empty output is `None`.
    pub fn inspect(&self, command: &str) -> Option<String> {
        match self.run(command, false) {
            Ok(result) if result.succeeded() && !result.stdout.trim().is_empty() => {
                Some(result.stdout)
            }
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(command, error = %err, "inspection command did not start");
                None
            }
        }
    }

    /// Read-only probe whose output matters even on a non-zero exit. Empty when the command
    /// could not start.
    pub fn capture(&self, command: &str) -> String {
        self.run(command, false)
            .map(|result| result.combined_output())
            .unwrap_or_default()
    }

    /// Read-only check that only cares about the exit status.
    pub fn check(&self, command: &str) -> bool {
        self.run(command, false)
            .map(|result| result.succeeded())
            .unwrap_or(false)
    }

    pub fn has_program(&self, name: &str) -> bool {
        self.check(&format!("command -v {name} >/dev/null 2>&1"))
    }
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}
