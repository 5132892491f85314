use std::cell::OnceCell;
use std::fs;

use regex::Regex;

use fwstage_core::{Executor, HostLayout, VersionInfo};

use crate::facts::{reports_pending_update, update_check_output};
use crate::firmware::{parse_firmware_status, FirmwareReport};
use crate::mirror::{exact_branch_version, meta_conf_url, MirrorClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeQuery {
    Current,
    Minor { current: VersionInfo },
    Major { current: VersionInfo },
}

/// Shared, per-oracle view of the host used by every probe.
pub struct ProbeContext<'a> {
    pub executor: &'a Executor<'a>,
    pub layout: &'a HostLayout,
    pub mirror_client: &'a dyn MirrorClient,
    pub mirror_url: String,
    firmware: OnceCell<Option<FirmwareReport>>,
}

impl<'a> ProbeContext<'a> {
    pub fn new(
        executor: &'a Executor<'a>,
        layout: &'a HostLayout,
        mirror_client: &'a dyn MirrorClient,
        mirror_url: String,
    ) -> Self {
        Self {
            executor,
            layout,
            mirror_client,
            mirror_url,
            firmware: OnceCell::new(),
        }
    }

    /// `configctl firmware status`, queried at most once.
    pub fn firmware(&self) -> Option<&FirmwareReport> {
        self.firmware
            .get_or_init(|| {
                if !self.executor.has_program("configctl") {
                    return None;
                }
                let raw = self.executor.capture("configctl firmware status 2>&1");
                if raw.trim().is_empty() {
                    return None;
                }
                Some(parse_firmware_status(&raw))
            })
            .as_ref()
    }
}

/// One independent source of version information.
pub trait VersionProbe {
    fn name(&self) -> &'static str;

    /// A version for `query`, or `None` when this source has nothing confident to say.
    fn attempt(&self, query: ProbeQuery, ctx: &ProbeContext<'_>) -> Option<VersionInfo>;
}

pub struct InstalledVersionProbe;
pub struct FirmwareStatusProbe;
pub struct PkgQueryProbe;
pub struct UpdateCheckProbe;
pub struct PkgCatalogProbe;
pub struct PkgSearchProbe;
pub struct MirrorPatchProbe;
pub struct MirrorBranchProbe;
pub struct ChangelogProbe;

impl VersionProbe for InstalledVersionProbe {
    fn name(&self) -> &'static str {
        "installed-version"
    }

    fn attempt(&self, query: ProbeQuery, ctx: &ProbeContext<'_>) -> Option<VersionInfo> {
        if query != ProbeQuery::Current {
            return None;
        }
        let output = ctx.executor.inspect("opnsense-version")?;
        parse_installed_version(&output)
    }
}

impl VersionProbe for FirmwareStatusProbe {
    fn name(&self) -> &'static str {
        "firmware-status"
    }

    fn attempt(&self, query: ProbeQuery, ctx: &ProbeContext<'_>) -> Option<VersionInfo> {
        let report = ctx.firmware()?;
        match query {
            ProbeQuery::Current => report.product_version,
            ProbeQuery::Minor { current } => report.minor_candidate(&current),
            ProbeQuery::Major { current } => report.major_candidate(&current),
        }
    }
}

impl VersionProbe for PkgQueryProbe {
    fn name(&self) -> &'static str {
        "pkg-query"
    }

    fn attempt(&self, query: ProbeQuery, ctx: &ProbeContext<'_>) -> Option<VersionInfo> {
        if query != ProbeQuery::Current {
            return None;
        }
        let output = ctx.executor.inspect("pkg query '%v' opnsense")?;
        VersionInfo::parse(output.lines().next()?).ok()
    }
}

impl VersionProbe for UpdateCheckProbe {
    fn name(&self) -> &'static str {
        "update-check"
    }

    fn attempt(&self, query: ProbeQuery, ctx: &ProbeContext<'_>) -> Option<VersionInfo> {
        let ProbeQuery::Minor { .. } = query else {
            return None;
        };
        if !ctx.executor.has_program("opnsense-update") {
            return None;
        }
        let output = update_check_output(ctx.executor);
        if !reports_pending_update(&output) {
            return None;
        }
        newest_version_in(&output)
    }
}

impl VersionProbe for PkgCatalogProbe {
    fn name(&self) -> &'static str {
        "pkg-catalog"
    }

    fn attempt(&self, query: ProbeQuery, ctx: &ProbeContext<'_>) -> Option<VersionInfo> {
        let ProbeQuery::Minor { .. } = query else {
            return None;
        };
        let output = ctx.executor.inspect("pkg rquery '%v' opnsense 2>/dev/null")?;
        VersionInfo::parse(output.lines().next()?).ok()
    }
}

impl VersionProbe for PkgSearchProbe {
    fn name(&self) -> &'static str {
        "pkg-search"
    }

    fn attempt(&self, query: ProbeQuery, ctx: &ProbeContext<'_>) -> Option<VersionInfo> {
        let ProbeQuery::Minor { .. } = query else {
            return None;
        };
        let output = ctx
            .executor
            .inspect("pkg search -q -e -S name opnsense 2>/dev/null | head -1")?;
        let pattern = Regex::new(r"(\d{2}\.\d+\.\d+)").ok()?;
        VersionInfo::parse(&pattern.captures(&output)?[1]).ok()
    }
}

impl VersionProbe for MirrorPatchProbe {
    fn name(&self) -> &'static str {
        "mirror-patch"
    }

    fn attempt(&self, query: ProbeQuery, ctx: &ProbeContext<'_>) -> Option<VersionInfo> {
        let ProbeQuery::Minor { current } = query else {
            return None;
        };
        exact_branch_version(
            ctx.executor,
            ctx.mirror_client,
            &ctx.mirror_url,
            current.branch(),
        )
    }
}

impl VersionProbe for MirrorBranchProbe {
    fn name(&self) -> &'static str {
        "mirror-branch"
    }

    fn attempt(&self, query: ProbeQuery, ctx: &ProbeContext<'_>) -> Option<VersionInfo> {
        let ProbeQuery::Major { current } = query else {
            return None;
        };
        for branch in current.branch().successors() {
            ctx.executor
                .log()
                .info(&format!("Checking mirror for {branch}..."));
            if !ctx
                .mirror_client
                .exists(&meta_conf_url(&ctx.mirror_url, branch))
            {
                continue;
            }
            let exact =
                exact_branch_version(ctx.executor, ctx.mirror_client, &ctx.mirror_url, branch)
                    .filter(|version| version.branch() == branch);
            return Some(exact.unwrap_or_else(|| branch.as_version()));
        }
        None
    }
}

impl VersionProbe for ChangelogProbe {
    fn name(&self) -> &'static str {
        "changelog"
    }

    fn attempt(&self, query: ProbeQuery, ctx: &ProbeContext<'_>) -> Option<VersionInfo> {
        let current = match query {
            ProbeQuery::Current => return None,
            ProbeQuery::Minor { current } | ProbeQuery::Major { current } => current,
        };
        let entries = fs::read_dir(ctx.layout.changelog_dir()).ok()?;
        let pattern = Regex::new(r"^(\d+\.\d+(?:\.\d+){0,2})").ok()?;
        let versions = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                pattern
                    .captures(&name)
                    .and_then(|captures| VersionInfo::parse(&captures[1]).ok())
            })
            .collect::<Vec<_>>();

        match query {
            ProbeQuery::Minor { .. } => versions
                .into_iter()
                .filter(|version| version.same_branch(&current))
                .max(),
            _ => versions
                .into_iter()
                .filter(|version| version.branch() > current.branch())
                .max(),
        }
    }
}

/// `opnsense-version` prints `OPNsense 26.1.1_5 (amd64)`, older builds only the version.
pub fn parse_installed_version(output: &str) -> Option<VersionInfo> {
    let mut parts = output.split_whitespace();
    let first = parts.next()?;
    let raw = parts.next().unwrap_or(first);
    VersionInfo::parse(raw).ok()
}

fn newest_version_in(text: &str) -> Option<VersionInfo> {
    let pattern = Regex::new(r"(\d{2}\.\d+(?:\.\d+){0,2})(?:_\d+)?").ok()?;
    pattern
        .captures_iter(text)
        .filter_map(|captures| VersionInfo::parse(&captures[1]).ok())
        .max()
}
