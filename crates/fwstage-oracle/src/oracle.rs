use fwstage_core::{Branch, UpgradeError, UpgradeResult, VersionInfo};

use crate::mirror::meta_conf_url;
use crate::probe::{
    ChangelogProbe, FirmwareStatusProbe, InstalledVersionProbe, MirrorBranchProbe,
    MirrorPatchProbe, PkgCatalogProbe, PkgQueryProbe, PkgSearchProbe, ProbeContext, ProbeQuery,
    UpdateCheckProbe, VersionProbe,
};

/// A version together with the probe that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub version: VersionInfo,
    pub probe: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSurvey {
    pub current: Resolved,
    pub minor: Option<Resolved>,
    pub major: Option<Resolved>,
}

impl VersionSurvey {
    pub fn is_up_to_date(&self) -> bool {
        self.minor.is_none() && self.major.is_none()
    }
}

pub struct VersionOracle<'a> {
    ctx: ProbeContext<'a>,
    current_probes: Vec<Box<dyn VersionProbe + 'a>>,
    minor_probes: Vec<Box<dyn VersionProbe + 'a>>,
    major_probes: Vec<Box<dyn VersionProbe + 'a>>,
}

impl<'a> VersionOracle<'a> {
    pub fn new(ctx: ProbeContext<'a>) -> Self {
        Self::with_probes(
            ctx,
            vec![
                Box::new(InstalledVersionProbe),
                Box::new(FirmwareStatusProbe),
                Box::new(PkgQueryProbe),
            ],
            vec![
                Box::new(FirmwareStatusProbe),
                Box::new(UpdateCheckProbe),
                Box::new(PkgCatalogProbe),
                Box::new(PkgSearchProbe),
                Box::new(MirrorPatchProbe),
                Box::new(ChangelogProbe),
            ],
            vec![
                Box::new(FirmwareStatusProbe),
                Box::new(MirrorBranchProbe),
                Box::new(ChangelogProbe),
            ],
        )
    }

    pub fn with_probes(
        ctx: ProbeContext<'a>,
        current_probes: Vec<Box<dyn VersionProbe + 'a>>,
        minor_probes: Vec<Box<dyn VersionProbe + 'a>>,
        major_probes: Vec<Box<dyn VersionProbe + 'a>>,
    ) -> Self {
        Self {
            ctx,
            current_probes,
            minor_probes,
            major_probes,
        }
    }

    pub fn context(&self) -> &ProbeContext<'a> {
        &self.ctx
    }

    pub fn resolve_current(&self) -> UpgradeResult<Resolved> {
        let tried = self
            .current_probes
            .iter()
            .map(|probe| probe.name())
            .collect::<Vec<_>>()
            .join(", ");
        self.first_answer(&self.current_probes, ProbeQuery::Current, |_| true)
            .ok_or_else(|| UpgradeError::VersionUnresolvable(format!("no probe answered ({tried})")))
    }

    /// Newer version on the current branch, if any source reports one.
    pub fn resolve_minor_candidate(&self, current: &VersionInfo) -> Option<Resolved> {
        self.first_answer(
            &self.minor_probes,
            ProbeQuery::Minor { current: *current },
            |version| version.is_minor_candidate_for(current),
        )
    }

    /// Version on a newer branch, if any source reports one.
    pub fn resolve_major_candidate(&self, current: &VersionInfo) -> Option<Resolved> {
        self.first_answer(
            &self.major_probes,
            ProbeQuery::Major { current: *current },
            |version| version.is_major_candidate_for(current),
        )
    }

    pub fn survey(&self) -> UpgradeResult<VersionSurvey> {
        let current = self.resolve_current()?;
        let minor = self.resolve_minor_candidate(&current.version);
        let major = self.resolve_major_candidate(&current.version);
        Ok(VersionSurvey {
            current,
            minor,
            major,
        })
    }

    /// Installed version straight from the package database, bypassing cached firmware data.
    pub fn installed_version(&self) -> Option<VersionInfo> {
        [
            &InstalledVersionProbe as &dyn VersionProbe,
            &PkgQueryProbe as &dyn VersionProbe,
        ]
        .into_iter()
        .find_map(|probe| probe.attempt(ProbeQuery::Current, &self.ctx))
    }

    pub fn branch_on_mirror(&self, branch: Branch) -> bool {
        let url = meta_conf_url(&self.ctx.mirror_url, branch);
        let log = self.ctx.executor.log();
        log.info(&format!("Validating branch {branch} on mirror..."));
        if self.ctx.mirror_client.exists(&url) {
            log.success(&format!("Branch {branch} found on mirror"));
            true
        } else {
            log.error(&format!("Branch {branch} not found on pkg mirror (checked {url})"));
            false
        }
    }

    fn first_answer(
        &self,
        probes: &[Box<dyn VersionProbe + 'a>],
        query: ProbeQuery,
        accept: impl Fn(&VersionInfo) -> bool,
    ) -> Option<Resolved> {
        let log = self.ctx.executor.log();
        for probe in probes {
            let Some(version) = probe.attempt(query, &self.ctx) else {
                tracing::debug!(probe = probe.name(), ?query, "probe had no answer");
                continue;
            };
            if !accept(&version) {
                tracing::debug!(probe = probe.name(), %version, ?query, "probe answer is not a candidate");
                continue;
            }
            match query {
                ProbeQuery::Current => {
                    log.info(&format!("Current version {version} (via {})", probe.name()))
                }
                ProbeQuery::Minor { .. } => log.success(&format!(
                    "Minor update available ({}): {version}",
                    probe.name()
                )),
                ProbeQuery::Major { .. } => log.success(&format!(
                    "Major upgrade available ({}): {version}",
                    probe.name()
                )),
            }
            return Some(Resolved {
                version,
                probe: probe.name(),
            });
        }
        None
    }
}
