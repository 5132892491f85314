use std::cell::RefCell;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::HostLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Query,
    DryRun,
    Upgrade,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::DryRun => "dryrun",
            Self::Upgrade => "upgrade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Success => "OK",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Per-run log. Every line becomes a `tracing` event and a plain-text line in the run's log
/// file. File writes are best effort: a read-only or missing log directory never stops a run.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: RefCell<Option<File>>,
    captured: Option<RefCell<Vec<String>>>,
}

impl RunLog {
    pub fn create(layout: &HostLayout, kind: RunKind) -> Self {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let path = layout.run_log_path(kind.as_str(), &stamp);
        let file = fs::create_dir_all(layout.log_dir())
            .and_then(|_| File::create(&path))
            .map_err(|err| {
                tracing::warn!(path = %path.display(), error = %err, "run log file unavailable");
            })
            .ok();
        Self {
            path,
            file: RefCell::new(file),
            captured: None,
        }
    }

    /// A log that keeps its lines in memory instead of on disk.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from("(memory)"),
            file: RefCell::new(None),
            captured: Some(RefCell::new(Vec::new())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> Vec<String> {
        self.captured
            .as_ref()
            .map(|lines| lines.borrow().clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.captured
            .as_ref()
            .is_some_and(|lines| lines.borrow().iter().any(|line| line.contains(needle)))
    }

    pub fn info(&self, message: &str) {
        tracing::info!("{message}");
        self.record(LogLevel::Info, message);
    }

    pub fn success(&self, message: &str) {
        tracing::info!(outcome = "ok", "{message}");
        self.record(LogLevel::Success, message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!("{message}");
        self.record(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!("{message}");
        self.record(LogLevel::Error, message);
    }

    pub fn section(&self, title: &str) {
        tracing::info!(section = title, "== {title} ==");
        self.write_line(&format!("\n=== {title} ==="));
    }

    /// Appends raw command output verbatim; not echoed to the console.
    pub fn append_raw(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        tracing::debug!(bytes = text.len(), "command output captured");
        self.write_line(text.trim_end());
    }

    fn record(&self, level: LogLevel, message: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.write_line(&format!("[{stamp}] [{}] {message}", level.label()));
    }

    fn write_line(&self, line: &str) {
        if let Some(captured) = &self.captured {
            captured.borrow_mut().push(line.to_string());
        }
        let mut file = self.file.borrow_mut();
        let failed = match file.as_mut() {
            Some(handle) => writeln!(handle, "{line}").is_err(),
            None => false,
        };
        if failed {
            tracing::warn!(path = %self.path.display(), "run log write failed; file logging disabled");
            *file = None;
        }
    }
}
