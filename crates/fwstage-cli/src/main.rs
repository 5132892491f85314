mod completion;
mod dispatch;
mod prompt;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{CommandFactory, Parser};
use fwstage_core::{RunKind, VersionTarget};
use fwstage_engine::{ResumeRequest, RunRequest, TargetSpec};

use crate::completion::CliCompletionShell;
use crate::render::{current_output_style, render_status_line};

const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/fwstage.toml";
const LOG_FILTER_ENV: &str = "FWSTAGE_LOG";

#[derive(Parser, Debug)]
#[command(name = "fwstage")]
#[command(
    about = "Resumable in-place OPNsense firmware upgrades",
    long_about = "Runs OPNsense minor updates and major upgrades as a sequence of checkpointed \
                  stages that survive reboots. Runs are dry-runs unless -x is given."
)]
#[command(version)]
struct Cli {
    /// Show the installed version and the available updates
    #[arg(short = 'l', long)]
    list_versions: bool,

    /// Major upgrade to VERSION, or to the newest branch on the mirror when omitted
    #[arg(
        short = 't',
        long,
        value_name = "VERSION",
        num_args = 0..=1,
        default_missing_value = "auto"
    )]
    target: Option<String>,

    /// Minor update within the installed branch
    #[arg(short = 'm', long)]
    minor: bool,

    /// Apply changes instead of printing the plan
    #[arg(short = 'x', long)]
    execute: bool,

    /// Back up config.xml and the package list, then exit
    #[arg(short = 'b', long)]
    backup: bool,

    /// Skip confirmation prompts
    #[arg(short = 'f', long)]
    force: bool,

    /// Continue an interrupted upgrade
    #[arg(short = 'r', long)]
    resume: bool,

    /// Discard the upgrade checkpoint and the auto-resume hook
    #[arg(short = 'c', long)]
    clean: bool,

    /// Report the checkpoint, resume hook, versions and reboot flag
    #[arg(short = 's', long)]
    status: bool,

    /// Configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print a shell completion script
    #[arg(long, value_name = "SHELL", value_enum)]
    completions: Option<CliCompletionShell>,
}

/// What one invocation does. Earlier variants win when several flags are given.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Help,
    Completions(CliCompletionShell),
    Clean,
    Status,
    ListVersions,
    Backup,
    Resume(ResumeRequest),
    Run(RunRequest),
}

impl Action {
    fn run_kind(&self) -> RunKind {
        match self {
            Action::Status | Action::ListVersions | Action::Help | Action::Completions(_) => {
                RunKind::Query
            }
            Action::Resume(request) if !request.execute => RunKind::DryRun,
            Action::Run(request) if !request.execute => RunKind::DryRun,
            Action::Clean | Action::Backup | Action::Resume(_) | Action::Run(_) => {
                RunKind::Upgrade
            }
        }
    }

    fn requires_root(&self) -> bool {
        match self {
            Action::Clean | Action::Backup => true,
            Action::Resume(request) => request.execute,
            Action::Run(request) => request.execute,
            Action::Help | Action::Completions(_) | Action::Status | Action::ListVersions => false,
        }
    }
}

fn resolve_action(cli: &Cli) -> Result<Action> {
    if let Some(shell) = cli.completions {
        return Ok(Action::Completions(shell));
    }
    if cli.clean {
        return Ok(Action::Clean);
    }
    if cli.status {
        return Ok(Action::Status);
    }
    if cli.list_versions {
        return Ok(Action::ListVersions);
    }
    // With a run requested, the BACKUP stage already takes the backup.
    if cli.backup && !cli.minor && !cli.resume && cli.target.is_none() {
        return Ok(Action::Backup);
    }

    let target = cli.target.as_deref().map(parse_target_arg).transpose()?;
    if cli.resume {
        let target = match target {
            Some(TargetSpec::Version(target)) => Some(target),
            Some(TargetSpec::Auto) | None => None,
        };
        return Ok(Action::Resume(ResumeRequest {
            execute: cli.execute,
            force: cli.force,
            target,
        }));
    }
    if cli.minor || target.is_some() {
        return Ok(Action::Run(RunRequest {
            target,
            minor: cli.minor,
            execute: cli.execute,
            force: cli.force,
        }));
    }
    Ok(Action::Help)
}

fn parse_target_arg(raw: &str) -> Result<TargetSpec> {
    if raw.trim().eq_ignore_ascii_case("auto") {
        return Ok(TargetSpec::Auto);
    }
    VersionTarget::parse(raw)
        .map(TargetSpec::Version)
        .map_err(|err| anyhow!("invalid --target '{raw}': {err}"))
}

fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if matches!(resolve_action(&cli), Ok(Action::Help)) {
        let _ = Cli::command().print_help();
        println!();
        return ExitCode::SUCCESS;
    }

    init_tracing();
    let code = match dispatch::run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!(
                "{}",
                render_status_line(current_output_style(), "error", &err.to_string())
            );
            err.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[cfg(test)]
mod tests;
