use std::path::{Path, PathBuf};

/// Host paths touched by an upgrade, all derived from one root so a temporary directory can
/// stand in for `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, absolute: &str) -> PathBuf {
        self.root.join(absolute.trim_start_matches('/'))
    }

    pub fn state_path(&self) -> PathBuf {
        self.host_path("/var/db/opnsense-upgrade.state")
    }

    pub fn completion_record_path(&self) -> PathBuf {
        self.host_path("/var/db/opnsense-upgrade.last")
    }

    pub fn resume_hook_path(&self) -> PathBuf {
        self.host_path("/etc/rc.local.d/99-opnsense-upgrade-resume")
    }

    pub fn resume_log_path(&self) -> PathBuf {
        self.host_path("/var/log/opnsense-upgrade-resume.log")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.host_path("/var/log/opnsense-upgrades")
    }

    pub fn run_log_path(&self, kind: &str, stamp: &str) -> PathBuf {
        self.log_dir().join(format!("opnsense-{kind}-{stamp}.log"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.host_path("/root/config-backups")
    }

    pub fn config_xml_path(&self) -> PathBuf {
        self.host_path("/conf/config.xml")
    }

    pub fn pkg_repo_conf_path(&self) -> PathBuf {
        self.host_path("/usr/local/etc/pkg/repos/OPNsense.conf")
    }

    pub fn changelog_dir(&self) -> PathBuf {
        self.host_path("/usr/local/opnsense/changelog")
    }

    pub fn reboot_required_path(&self) -> PathBuf {
        self.host_path("/var/run/reboot_required")
    }

    pub fn pkg_lock_path(&self) -> PathBuf {
        self.host_path("/var/run/pkg.lock")
    }

    pub fn default_config_path(&self) -> PathBuf {
        self.host_path("/usr/local/etc/fwstage.toml")
    }

    /// Paths whose contents CLEANUP empties.
    pub fn scratch_dirs(&self) -> [PathBuf; 2] {
        [self.host_path("/tmp"), self.host_path("/var/tmp")]
    }
}
