use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

/// Canonical firmware version: `year.month[.patch[.revision]]`.
///
/// Package revision suffixes (`26.1.2_5`) are stripped during parsing, so two
/// strings that differ only by that suffix normalize to the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionInfo {
    pub year: u16,
    pub month: u8,
    pub patch: u16,
    pub revision: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Branch {
    pub year: u16,
    pub month: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeKind {
    None,
    Minor,
    Major,
}

/// Operator-supplied target. A bare branch (`26.7`) is reached by any version
/// on that branch; an exact version must match after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionTarget {
    pub version: VersionInfo,
    pub branch_only: bool,
}

impl VersionInfo {
    pub fn new(year: u16, month: u8, patch: u16, revision: u16) -> Self {
        Self {
            year,
            month,
            patch,
            revision,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(parse_components(raw)?.0)
    }

    pub fn branch(&self) -> Branch {
        Branch {
            year: self.year,
            month: self.month,
        }
    }

    pub fn same_branch(&self, other: &VersionInfo) -> bool {
        self.branch() == other.branch()
    }

    /// Classifies the move from `self` to `to`. Moving backwards is `None`.
    pub fn upgrade_kind_to(&self, to: &VersionInfo) -> UpgradeKind {
        if to <= self {
            return UpgradeKind::None;
        }
        if self.same_branch(to) {
            UpgradeKind::Minor
        } else {
            UpgradeKind::Major
        }
    }

    pub fn is_minor_candidate_for(&self, current: &VersionInfo) -> bool {
        current.upgrade_kind_to(self) == UpgradeKind::Minor
    }

    pub fn is_major_candidate_for(&self, current: &VersionInfo) -> bool {
        current.upgrade_kind_to(self) == UpgradeKind::Major
    }
}

impl Branch {
    pub fn new(year: u16, month: u8) -> Self {
        Self { year, month }
    }

    pub fn as_version(&self) -> VersionInfo {
        VersionInfo::new(self.year, self.month, 0, 0)
    }

    /// Branches that may follow this one, in the order the mirror is probed.
    pub fn successors(&self) -> [Branch; 2] {
        if self.month >= 7 {
            [
                Branch::new(self.year + 1, 1),
                Branch::new(self.year + 1, 7),
            ]
        } else {
            [Branch::new(self.year, 7), Branch::new(self.year + 1, 1)]
        }
    }
}

impl VersionTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        let (version, components) = parse_components(raw)?;
        Ok(Self {
            version,
            branch_only: components == 2,
        })
    }

    pub fn from_version(version: VersionInfo) -> Self {
        Self {
            version,
            branch_only: false,
        }
    }

    pub fn branch(&self) -> Branch {
        self.version.branch()
    }

    pub fn is_reached_by(&self, current: &VersionInfo) -> bool {
        if self.branch_only {
            current.branch() == self.branch()
        } else {
            current >= &self.version && current.same_branch(&self.version)
        }
    }
}

/// Removes a trailing package revision (`_5`) and surrounding whitespace.
pub fn strip_revision_suffix(raw: &str) -> &str {
    let trimmed = raw.trim();
    match trimmed.rsplit_once('_') {
        Some((head, tail)) if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => trimmed,
    }
}

fn parse_components(raw: &str) -> Result<(VersionInfo, usize)> {
    let stripped = strip_revision_suffix(raw);
    if stripped.is_empty() {
        return Err(anyhow!("version string must not be empty"));
    }

    let parts = stripped.split('.').collect::<Vec<_>>();
    if !(2..=4).contains(&parts.len()) {
        return Err(anyhow!(
            "invalid version '{raw}': expected year.month[.patch[.revision]]"
        ));
    }

    let number = |index: usize, field: &str| -> Result<u16> {
        let Some(part) = parts.get(index) else {
            return Ok(0);
        };
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(anyhow!("invalid {field} component in version '{raw}'"));
        }
        part.parse::<u16>()
            .with_context(|| format!("{field} component out of range in version '{raw}'"))
    };

    let year = number(0, "year")?;
    let month = number(1, "month")?;
    if month == 0 || month > 12 {
        return Err(anyhow!("invalid month {month} in version '{raw}'"));
    }

    Ok((
        VersionInfo {
            year,
            month: month as u8,
            patch: number(2, "patch")?,
            revision: number(3, "revision")?,
        },
        parts.len(),
    ))
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.year, self.month, self.patch)?;
        if self.revision > 0 {
            write!(f, ".{}", self.revision)?;
        }
        Ok(())
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.year, self.month)
    }
}

impl fmt::Display for VersionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.branch_only {
            write!(f, "{}", self.branch())
        } else {
            write!(f, "{}", self.version)
        }
    }
}

impl FromStr for VersionInfo {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl FromStr for VersionTarget {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}
