use super::*;
use std::path::Path;

use clap::error::ErrorKind;
use fwstage_core::VersionInfo;
use fwstage_engine::{CleanReport, Outcome};

use crate::completion::write_completions_script;
use crate::dispatch::resume_args;
use crate::prompt::is_affirmative;
use crate::render::{
    format_clean_lines, format_outcome_lines, resolve_output_style, OutputStyle,
};

fn parse(args: &[&str]) -> Action {
    let mut argv = vec!["fwstage"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).expect("must parse arguments");
    resolve_action(&cli).expect("must resolve action")
}

#[test]
fn no_arguments_prints_help() {
    assert_eq!(parse(&[]), Action::Help);
    assert_eq!(parse(&["-x"]), Action::Help);
}

#[test]
fn bare_target_flag_means_newest_branch() {
    assert_eq!(
        parse(&["-t"]),
        Action::Run(RunRequest {
            target: Some(TargetSpec::Auto),
            minor: false,
            execute: false,
            force: false,
        })
    );
    assert_eq!(
        parse(&["-t", "-x", "-f"]),
        Action::Run(RunRequest {
            target: Some(TargetSpec::Auto),
            minor: false,
            execute: true,
            force: true,
        })
    );
}

#[test]
fn explicit_target_is_parsed_as_version() {
    let expected = VersionTarget::parse("26.7").expect("must parse target");
    assert_eq!(
        parse(&["-t", "26.7", "-x"]),
        Action::Run(RunRequest {
            target: Some(TargetSpec::Version(expected)),
            minor: false,
            execute: true,
            force: false,
        })
    );
}

#[test]
fn invalid_target_is_rejected() {
    let cli = Cli::try_parse_from(["fwstage", "-t", "latest"]).expect("must parse arguments");
    let err = resolve_action(&cli).expect_err("non-version target should fail");
    assert!(
        err.to_string().contains("invalid --target 'latest'"),
        "unexpected error: {err}"
    );
}

#[test]
fn minor_flag_selects_minor_run() {
    assert_eq!(
        parse(&["-m"]),
        Action::Run(RunRequest {
            target: None,
            minor: true,
            execute: false,
            force: false,
        })
    );
}

#[test]
fn resume_keeps_explicit_target_and_drops_auto() {
    let expected = VersionTarget::parse("26.1.2").expect("must parse target");
    assert_eq!(
        parse(&["-r", "-t", "26.1.2", "-x"]),
        Action::Resume(ResumeRequest {
            execute: true,
            force: false,
            target: Some(expected),
        })
    );
    assert_eq!(
        parse(&["-r", "-t"]),
        Action::Resume(ResumeRequest {
            execute: false,
            force: false,
            target: None,
        })
    );
}

#[test]
fn management_flags_take_priority_over_runs() {
    assert_eq!(parse(&["-c", "-s", "-t"]), Action::Clean);
    assert_eq!(parse(&["-s", "-l", "-m"]), Action::Status);
    assert_eq!(parse(&["-l", "-b"]), Action::ListVersions);
    assert_eq!(parse(&["-b"]), Action::Backup);
    assert_eq!(parse(&["-b", "-x"]), Action::Backup);
    assert_eq!(
        parse(&["--completions", "zsh", "-c"]),
        Action::Completions(CliCompletionShell::Zsh)
    );
}

#[test]
fn backup_flag_alongside_a_run_starts_the_run() {
    assert_eq!(
        parse(&["-x", "-m", "-b"]),
        Action::Run(RunRequest {
            target: None,
            minor: true,
            execute: true,
            force: false,
        })
    );
    assert_eq!(
        parse(&["-b", "-t"]),
        Action::Run(RunRequest {
            target: Some(TargetSpec::Auto),
            minor: false,
            execute: false,
            force: false,
        })
    );
    assert_eq!(
        parse(&["-b", "-r"]),
        Action::Resume(ResumeRequest {
            execute: false,
            force: false,
            target: None,
        })
    );
}

#[test]
fn unknown_completion_shell_is_a_parse_error() {
    let err = Cli::try_parse_from(["fwstage", "--completions", "tcsh"])
        .expect_err("unsupported shell should fail");
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn dry_runs_and_queries_do_not_require_root() {
    assert!(!parse(&["-s"]).requires_root());
    assert!(!parse(&["-l"]).requires_root());
    assert!(!parse(&["-t"]).requires_root());
    assert!(!parse(&["-r"]).requires_root());
    assert!(parse(&["-t", "-x"]).requires_root());
    assert!(parse(&["-r", "-x"]).requires_root());
    assert!(parse(&["-c"]).requires_root());
    assert!(parse(&["-b"]).requires_root());
}

#[test]
fn run_kind_follows_execute_flag() {
    assert_eq!(parse(&["-l"]).run_kind(), RunKind::Query);
    assert_eq!(parse(&["-m"]).run_kind(), RunKind::DryRun);
    assert_eq!(parse(&["-m", "-x"]).run_kind(), RunKind::Upgrade);
    assert_eq!(parse(&["-r"]).run_kind(), RunKind::DryRun);
    assert_eq!(parse(&["-b"]).run_kind(), RunKind::Upgrade);
}

#[test]
fn render_status_line_plain_is_bare_message() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "upgrade to 26.7 complete"),
        "upgrade to 26.7 complete"
    );
}

#[test]
fn render_status_line_rich_adds_badges() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "done"),
        "[OK] done"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "careful"),
        "[WARN] careful"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "error", "broken"),
        "[ERR] broken"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "info", "note"),
        "[..] note"
    );
}

#[test]
fn resolve_output_style_follows_stdout() {
    assert_eq!(resolve_output_style(true, true), OutputStyle::Rich);
    assert_eq!(resolve_output_style(true, false), OutputStyle::Rich);
    assert_eq!(resolve_output_style(false, true), OutputStyle::Plain);
    assert_eq!(resolve_output_style(false, false), OutputStyle::Plain);
}

#[test]
fn dry_run_outcome_lists_planned_steps() {
    let outcome = Outcome::DryRunComplete {
        planned: vec!["pkg autoremove -y".to_string(), "opnsense-update -p".to_string()],
    };
    let lines = format_outcome_lines(&outcome, OutputStyle::Plain);
    assert_eq!(
        lines,
        vec![
            "dry run complete: 2 mutating step(s) planned, nothing changed".to_string(),
            "  1. pkg autoremove -y".to_string(),
            "  2. opnsense-update -p".to_string(),
            "run again with -x to apply".to_string(),
        ]
    );
}

#[test]
fn minor_only_outcome_points_at_minor_flag() {
    let outcome = Outcome::MinorOnlyAvailable {
        current: VersionInfo::new(25, 7, 3, 0),
        minor: VersionInfo::new(25, 7, 5, 0),
    };
    let lines = format_outcome_lines(&outcome, OutputStyle::Rich);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "[WARN] no major upgrade available for 25.7.3");
    assert_eq!(lines[1], "[..] minor update 25.7.5 is available: run with -m");
}

#[test]
fn clean_lines_report_nothing_when_idle() {
    let idle = CleanReport {
        state_removed: false,
        hook_removed: false,
    };
    assert_eq!(
        format_clean_lines(&idle, OutputStyle::Plain),
        vec!["nothing to clean".to_string()]
    );

    let both = CleanReport {
        state_removed: true,
        hook_removed: true,
    };
    assert_eq!(format_clean_lines(&both, OutputStyle::Plain).len(), 2);
}

#[test]
fn completion_script_names_the_binary() {
    for shell in [
        CliCompletionShell::Bash,
        CliCompletionShell::Zsh,
        CliCompletionShell::Fish,
        CliCompletionShell::Powershell,
    ] {
        let mut output = Vec::new();
        write_completions_script(shell, &mut output).expect("must write completions");
        let script = String::from_utf8(output).expect("must be utf-8");
        assert!(script.contains("fwstage"), "{shell:?} script missing binary name");
    }
}

#[test]
fn resume_args_forward_absolute_config_path() {
    assert!(resume_args(None).is_empty());

    let dir = std::env::temp_dir().join(format!("fwstage-cli-tests-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("must create dir");
    let config = dir.join("fwstage.toml");
    std::fs::write(&config, "version = 1\n").expect("must write config");

    let args = resume_args(Some(&config));
    assert_eq!(args.len(), 2);
    assert_eq!(args[0], "--config");
    assert!(Path::new(&args[1]).is_absolute());
    assert!(args[1].ends_with("fwstage.toml"));

    let missing = resume_args(Some(Path::new("relative/missing.toml")));
    assert_eq!(missing[1], "relative/missing.toml");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn only_explicit_yes_confirms() {
    assert!(is_affirmative("y\n"));
    assert!(is_affirmative(" YES \n"));
    assert!(!is_affirmative("\n"));
    assert!(!is_affirmative("n\n"));
    assert!(!is_affirmative("yep\n"));
}
