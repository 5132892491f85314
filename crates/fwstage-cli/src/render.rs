use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use fwstage_engine::{BackupSummary, CheckpointStatus, CleanReport, Outcome, StatusReport};
use fwstage_oracle::{Resolved, VersionSurvey};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UiMode {
    Plain,
    Interactive,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
    mode: UiMode,
}

pub(crate) struct TerminalSpinner {
    style: OutputStyle,
    label: String,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self {
            style,
            mode: ui_mode_from_style(style),
        }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.mode, title) {
            println!();
            let rendered = match self.style {
                OutputStyle::Plain => line,
                OutputStyle::Rich => colorize(section_style(), &line),
            };
            println!("{rendered}");
        }
    }

    /// Spinner for work of unknown length. Drawn only in rich mode.
    pub(crate) fn start_spinner(self, label: &str) -> TerminalSpinner {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}")
            {
                progress_bar.set_style(style.tick_chars(progress_tick_chars(label)));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalSpinner {
            style: self.style,
            label: label.to_string(),
            progress_bar,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

impl TerminalSpinner {
    pub(crate) fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        println!(
            "{}",
            render_status_line(
                self.style,
                "ok",
                &format!(
                    "{} complete in {}",
                    self.label,
                    format_elapsed(self.started_at.elapsed())
                )
            )
        );
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, _stderr_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::io::stderr().is_terminal(),
    )
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "error" => "[ERR]",
        "step" => "[>>]",
        _ => "[..]",
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn progress_tick_chars(label: &str) -> &'static str {
    match label {
        "survey" => ".oO@* ",
        "upgrade" => "-=~* ",
        _ => "|/-\\ ",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn ui_mode_from_style(style: OutputStyle) -> UiMode {
    match style {
        OutputStyle::Plain => UiMode::Plain,
        OutputStyle::Rich => UiMode::Interactive,
    }
}

fn render_section_header(mode: UiMode, title: &str) -> Option<String> {
    match mode {
        UiMode::Plain => None,
        UiMode::Interactive => Some(format!("== {title} ==")),
    }
}

fn describe_resolved(resolved: &Resolved) -> String {
    format!("{} (via {})", resolved.version, resolved.probe)
}

pub(crate) fn format_survey_lines(survey: &VersionSurvey, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "info",
        &format!("current: {}", describe_resolved(&survey.current)),
    )];
    lines.push(match &survey.minor {
        Some(minor) => render_status_line(
            style,
            "ok",
            &format!("minor update: {} (run with -m)", describe_resolved(minor)),
        ),
        None => render_status_line(style, "info", "minor update: none"),
    });
    lines.push(match &survey.major {
        Some(major) => render_status_line(
            style,
            "ok",
            &format!("major upgrade: {} (run with -t)", describe_resolved(major)),
        ),
        None => render_status_line(style, "info", "major upgrade: none"),
    });
    if survey.minor.is_some() && survey.major.is_some() {
        lines.push(render_status_line(
            style,
            "warn",
            "apply minor updates first: a major upgrade is refused while one is pending",
        ));
    }
    if survey.is_up_to_date() {
        lines.push(render_status_line(style, "ok", "System is up to date"));
    }
    lines
}

pub(crate) fn format_status_lines(report: &StatusReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(match &report.checkpoint {
        CheckpointStatus::Absent => render_status_line(style, "ok", "checkpoint: none"),
        CheckpointStatus::Present(state) => render_status_line(
            style,
            "warn",
            &format!(
                "checkpoint: {} upgrade to {} at {} (started {})",
                if state.minor_only { "minor" } else { "major" },
                state.target,
                state.stage,
                chrono_stamp(state.created_at)
            ),
        ),
        CheckpointStatus::Corrupt(reason) => render_status_line(
            style,
            "error",
            &format!("checkpoint: unreadable ({reason}); run with -c to discard it"),
        ),
    });
    lines.push(render_status_line(
        style,
        if report.hook_installed { "warn" } else { "ok" },
        &format!(
            "auto-resume hook: {}",
            if report.hook_installed {
                "installed"
            } else {
                "not installed"
            }
        ),
    ));
    match &report.survey {
        Ok(survey) => lines.extend(format_survey_lines(survey, style)),
        Err(reason) => lines.push(render_status_line(
            style,
            "error",
            &format!("versions: {reason}"),
        )),
    }
    if let Some(reboot) = &report.reboot {
        let status = match (reboot.needs_reboot, reboot.is_stale) {
            (true, false) => "warn",
            _ => "info",
        };
        lines.push(render_status_line(
            style,
            status,
            &format!("reboot flag: {}", reboot.explanation),
        ));
    }
    if report.reboot_required_flag {
        lines.push(render_status_line(
            style,
            "warn",
            "reboot required: the system asks for a reboot",
        ));
    }
    if let Some(target) = &report.last_target {
        lines.push(render_status_line(
            style,
            "info",
            &format!("last completed upgrade: {target}"),
        ));
    }
    lines
}

fn chrono_stamp(epoch: i64) -> String {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|stamp| {
            stamp
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| epoch.to_string())
}

pub(crate) fn format_outcome_lines(outcome: &Outcome, style: OutputStyle) -> Vec<String> {
    match outcome {
        Outcome::Completed { target, version } => vec![render_status_line(
            style,
            "ok",
            &match version {
                Some(version) => format!("upgrade to {target} complete, running {version}"),
                None => format!("upgrade to {target} complete"),
            },
        )],
        Outcome::DryRunComplete { planned } => {
            let mut lines = vec![render_status_line(
                style,
                "ok",
                &format!(
                    "dry run complete: {} mutating step(s) planned, nothing changed",
                    planned.len()
                ),
            )];
            lines.extend(
                planned
                    .iter()
                    .enumerate()
                    .map(|(index, step)| format!("  {}. {step}", index + 1)),
            );
            lines.push(render_status_line(style, "info", "run again with -x to apply"));
            lines
        }
        Outcome::RebootPending { next } => vec![render_status_line(
            style,
            "warn",
            &format!("reboot pending: the upgrade resumes at {next} after the reboot"),
        )],
        Outcome::AlreadyCurrent(version) => vec![render_status_line(
            style,
            "ok",
            &format!("already on version {version}, nothing to do"),
        )],
        Outcome::MinorOnlyAvailable { current, minor } => vec![
            render_status_line(
                style,
                "warn",
                &format!("no major upgrade available for {current}"),
            ),
            render_status_line(
                style,
                "info",
                &format!("minor update {minor} is available: run with -m"),
            ),
        ],
        Outcome::NothingToResume => {
            vec![render_status_line(style, "ok", "nothing to resume")]
        }
        Outcome::Cancelled => vec![render_status_line(style, "warn", "upgrade cancelled")],
    }
}

pub(crate) fn format_backup_lines(summary: &BackupSummary, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![
        render_status_line(
            style,
            "ok",
            &format!("configuration: {}", summary.config_copy.display()),
        ),
        render_status_line(
            style,
            "ok",
            &format!("package list: {}", summary.package_list.display()),
        ),
    ];
    if let Some(digest) = &summary.config_sha256 {
        lines.push(render_status_line(
            style,
            "info",
            &format!("sha256: {digest}"),
        ));
    }
    lines
}

pub(crate) fn format_clean_lines(report: &CleanReport, style: OutputStyle) -> Vec<String> {
    if !report.state_removed && !report.hook_removed {
        return vec![render_status_line(style, "info", "nothing to clean")];
    }
    let mut lines = Vec::new();
    if report.state_removed {
        lines.push(render_status_line(style, "ok", "upgrade checkpoint removed"));
    }
    if report.hook_removed {
        lines.push(render_status_line(style, "ok", "auto-resume hook removed"));
    }
    lines
}
