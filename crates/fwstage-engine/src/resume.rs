use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use fwstage_core::HostLayout;

/// Installs and removes the boot-time hook that re-invokes the orchestrator after a reboot.
#[derive(Debug, Clone)]
pub struct ResumeScheduler {
    hook_path: PathBuf,
    state_path: PathBuf,
    resume_log_path: PathBuf,
    settle_secs: u64,
}

impl ResumeScheduler {
    pub fn new(layout: &HostLayout, settle_secs: u64) -> Self {
        Self {
            hook_path: layout.resume_hook_path(),
            state_path: layout.state_path(),
            resume_log_path: layout.resume_log_path(),
            settle_secs,
        }
    }

    pub fn hook_path(&self) -> &Path {
        &self.hook_path
    }

    pub fn resume_log_path(&self) -> &Path {
        &self.resume_log_path
    }

    pub fn is_installed(&self) -> bool {
        self.hook_path.exists()
    }

    /// Writes the hook, replacing any previous one, with mode 0755.
    pub fn install(&self, program: &Path, extra_args: &[String]) -> Result<PathBuf> {
        if let Some(parent) = self.hook_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&self.hook_path, self.render_hook(program, extra_args)).with_context(|| {
            format!("failed to write resume hook {}", self.hook_path.display())
        })?;
        fs::set_permissions(&self.hook_path, fs::Permissions::from_mode(0o755)).with_context(
            || format!("failed to set resume hook mode {}", self.hook_path.display()),
        )?;
        Ok(self.hook_path.clone())
    }

    /// Returns whether a hook was removed.
    pub fn remove(&self) -> Result<bool> {
        match fs::remove_file(&self.hook_path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove resume hook {}", self.hook_path.display())
            }),
        }
    }

    pub fn render_hook(&self, program: &Path, extra_args: &[String]) -> String {
        let args = extra_args
            .iter()
            .map(|arg| format!(" '{}'", escape_single_quote_shell(arg)))
            .collect::<String>();
        format!(
            "#!/bin/sh\n\
             STATE_FILE='{state}'\n\
             SCRIPT_PATH='{program}'\n\
             if [ -f \"${{STATE_FILE}}\" ] && [ -f \"${{SCRIPT_PATH}}\" ]; then\n\
             \x20   logger -t opnsense-upgrade \"Auto-resuming upgrade after reboot\"\n\
             \x20   sleep {settle}\n\
             \x20   \"${{SCRIPT_PATH}}\" -x -r{args} >> '{resume_log}' 2>&1 &\n\
             fi\n",
            state = escape_single_quote_shell(&self.state_path.display().to_string()),
            program = escape_single_quote_shell(&program.display().to_string()),
            settle = self.settle_secs,
            resume_log = escape_single_quote_shell(&self.resume_log_path.display().to_string()),
        )
    }
}

pub(crate) fn escape_single_quote_shell(value: &str) -> String {
    value.replace('\'', "'\"'\"'")
}
