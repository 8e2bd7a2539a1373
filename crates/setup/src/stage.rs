//! Stages and result statuses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Ordered phase of a setup run. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetupStage {
    Preflight,
    DependencyResolution,
    Installers,
    Verification,
    Summaries,
}

impl SetupStage {
    /// Every stage, in execution order.
    pub const ORDER: [Self; 5] = [
        Self::Preflight,
        Self::DependencyResolution,
        Self::Installers,
        Self::Verification,
        Self::Summaries,
    ];

    /// Position in [`Self::ORDER`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Preflight => 0,
            Self::DependencyResolution => 1,
            Self::Installers => 2,
            Self::Verification => 3,
            Self::Summaries => 4,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::DependencyResolution => "dependency-resolution",
            Self::Installers => "installers",
            Self::Verification => "verification",
            Self::Summaries => "summaries",
        }
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SetupStage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::unknown_stage(s))
    }
}

/// Outcome of a task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Success,
    Skipped,
    Failed,
}

impl SetupStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SetupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
