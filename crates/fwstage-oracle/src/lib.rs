mod facts;
mod firmware;
mod mirror;
mod oracle;
mod probe;

pub use facts::{
    abi_mismatch, free_disk_mb, freebsd_major, freebsd_release, machine_arch, parse_boottime,
    pkg_abi_major, pkg_process_running, reports_pending_update, service_running,
    update_check_output, update_pending, uptime_secs, AbiMismatch, UPDATE_CHECK_COMMAND,
};
pub use firmware::{
    assess_reboot, last_check_age_secs, parse_firmware_status, parse_uptime_header,
    FirmwareReport, RebootAssessment,
};
pub use mirror::{
    branch_base_url, exact_branch_version, meta_conf_url, mirror_from_repo_conf,
    packagesite_commands, parse_meta_conf_version, parse_packagesite_version, resolve_mirror_url,
    HttpMirror, MirrorClient,
};
pub use oracle::{Resolved, VersionOracle, VersionSurvey};
pub use probe::{
    parse_installed_version, ChangelogProbe, FirmwareStatusProbe, InstalledVersionProbe,
    MirrorBranchProbe, MirrorPatchProbe, PkgCatalogProbe, PkgQueryProbe, PkgSearchProbe,
    ProbeContext, ProbeQuery, UpdateCheckProbe, VersionProbe,
};

#[cfg(test)]
mod tests;
