use std::fmt;

use anyhow::{anyhow, Result};

/// Ordered upgrade stages. The integer codes are what the checkpoint file stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    Precheck,
    Cleanup,
    Backup,
    BaseKernel,
    FixPkg,
    Packages,
    Verify,
    Done,
}

const ALL_STAGES: [StageId; 8] = [
    StageId::Precheck,
    StageId::Cleanup,
    StageId::Backup,
    StageId::BaseKernel,
    StageId::FixPkg,
    StageId::Packages,
    StageId::Verify,
    StageId::Done,
];

impl StageId {
    pub fn code(self) -> u8 {
        match self {
            Self::Precheck => 1,
            Self::Cleanup => 2,
            Self::Backup => 3,
            Self::BaseKernel => 4,
            Self::FixPkg => 6,
            Self::Packages => 7,
            Self::Verify => 8,
            Self::Done => 10,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        ALL_STAGES
            .iter()
            .copied()
            .find(|stage| stage.code() == code)
            .ok_or_else(|| anyhow!("unknown stage code {code}"))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Precheck => "PRECHECK",
            Self::Cleanup => "CLEANUP",
            Self::Backup => "BACKUP",
            Self::BaseKernel => "BASE_KERNEL",
            Self::FixPkg => "FIX_PKG",
            Self::Packages => "PACKAGES",
            Self::Verify => "VERIFY",
            Self::Done => "DONE",
        }
    }

    /// Stages a run visits, in order. The minor path never touches `FixPkg`.
    pub fn sequence(minor_only: bool) -> Vec<StageId> {
        ALL_STAGES
            .iter()
            .copied()
            .filter(|stage| !(minor_only && *stage == Self::FixPkg))
            .collect()
    }

    pub fn next_for(self, minor_only: bool) -> Option<StageId> {
        Self::sequence(minor_only)
            .into_iter()
            .find(|stage| *stage > self)
    }

    pub fn is_on_path(self, minor_only: bool) -> bool {
        !(minor_only && self == Self::FixPkg)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
