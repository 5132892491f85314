use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use fwstage_core::{RunLog, SystemRunner, UpgradeConfig, UpgradeError, UpgradeResult};
use fwstage_engine::Orchestrator;
use fwstage_oracle::HttpMirror;

use crate::completion::write_completions_script;
use crate::prompt::TerminalConfirm;
use crate::render::{
    format_backup_lines, format_clean_lines, format_outcome_lines, format_status_lines,
    format_survey_lines, TerminalRenderer,
};
use crate::{resolve_action, running_as_root, Action, Cli, DEFAULT_CONFIG_PATH};

pub(crate) fn run_cli(cli: Cli) -> UpgradeResult<i32> {
    let action = resolve_action(&cli)?;
    if let Action::Completions(shell) = action {
        write_completions_script(shell, &mut io::stdout().lock())?;
        return Ok(0);
    }
    if action.requires_root() && !running_as_root() {
        return Err(UpgradeError::PreflightFailure(
            "this operation must be run as root".to_string(),
        ));
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = UpgradeConfig::load(&config_path, cli.config.is_some())?;
    let log = RunLog::create(&config.layout(), action.run_kind());
    tracing::debug!(
        config = %config_path.display(),
        log = %log.path().display(),
        "starting {:?}",
        action.run_kind()
    );
    let renderer = TerminalRenderer::current();

    let runner = SystemRunner;
    let mirror = HttpMirror::new(Duration::from_secs(config.http_timeout_secs))?;
    let confirm = TerminalConfirm;
    let program =
        std::env::current_exe().context("failed to locate the running fwstage executable")?;
    let orchestrator = Orchestrator::new(&config, &runner, &mirror, &confirm, &log)
        .with_resume_command(program, resume_args(cli.config.as_deref()));

    let result = dispatch_action(&orchestrator, action, renderer);
    renderer.print_status("info", &format!("Log file: {}", log.path().display()));
    result
}

fn dispatch_action(
    orchestrator: &Orchestrator<'_>,
    action: Action,
    renderer: TerminalRenderer,
) -> UpgradeResult<i32> {
    let style = renderer.style();
    match action {
        Action::Help | Action::Completions(_) => Ok(0),
        Action::Clean => {
            let report = orchestrator.clean()?;
            renderer.print_lines(&format_clean_lines(&report, style));
            Ok(0)
        }
        Action::Status => {
            let report = orchestrator.status()?;
            renderer.print_section("Upgrade status");
            renderer.print_lines(&format_status_lines(&report, style));
            Ok(0)
        }
        Action::ListVersions => {
            let spinner = renderer.start_spinner("survey");
            let survey = orchestrator.list_versions();
            let survey = match survey {
                Ok(survey) => {
                    spinner.finish_success();
                    survey
                }
                Err(err) => {
                    spinner.finish_abandon();
                    return Err(err);
                }
            };
            renderer.print_section("Versions");
            renderer.print_lines(&format_survey_lines(&survey, style));
            Ok(0)
        }
        Action::Backup => {
            let summary = orchestrator.backup()?;
            renderer.print_lines(&format_backup_lines(&summary, style));
            Ok(0)
        }
        Action::Resume(request) => {
            let outcome = orchestrator.resume(request)?;
            renderer.print_section("Result");
            renderer.print_lines(&format_outcome_lines(&outcome, style));
            Ok(outcome.exit_code())
        }
        Action::Run(request) => {
            let outcome = orchestrator.run(request)?;
            renderer.print_section("Result");
            renderer.print_lines(&format_outcome_lines(&outcome, style));
            Ok(outcome.exit_code())
        }
    }
}

/// Extra arguments the boot hook passes so a resumed run reads the same configuration.
/// The hook runs from `/`, so a relative path is made absolute first.
pub(crate) fn resume_args(config: Option<&Path>) -> Vec<String> {
    config
        .map(|path| {
            let absolute = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
            vec!["--config".to_string(), absolute.display().to_string()]
        })
        .unwrap_or_default()
}
