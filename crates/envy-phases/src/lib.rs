//! Phase identifiers for the envy package pipeline
//!
//! Every package walks the same ordered sequence of phases. The ordering is
//! total and is relied on throughout the engine: dependents wait for a
//! dependency to *reach* a phase, and a record's target phase only ever
//! moves forward.
//!
//! # Phase order
//!
//! ```text
//! None → RecipeFetch → Check → Fetch → Stage → Build → Install → Deploy → Completion
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error returned when a phase name does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown phase name '{name}'")]
pub struct PhaseParseError {
    pub name: String,
}

/// One stage of the per-package state machine.
///
/// `Phase` is `Ord`: `Phase::Check < Phase::Fetch` etc., matching the
/// pipeline order. `None` is the pre-trigger state; `Completion` is the
/// successful terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not yet triggered.
    None,
    /// Resolve the package's script source into a concrete spec file.
    RecipeFetch,
    /// Probe the cache for an existing asset; acquire the entry lock if not.
    Check,
    /// Download or copy sources into the work area.
    Fetch,
    /// Extract or copy fetched content into the staging area.
    Stage,
    /// Produce artifacts in the install area.
    Build,
    /// Finalize installed content and compute the result hash.
    Install,
    /// Publish the asset path and commit the cache entry.
    Deploy,
    /// Successful terminal state; waiters are signaled.
    Completion,
}

impl Phase {
    /// All phases in pipeline order.
    pub const ALL: [Self; 9] = [
        Self::None,
        Self::RecipeFetch,
        Self::Check,
        Self::Fetch,
        Self::Stage,
        Self::Build,
        Self::Install,
        Self::Deploy,
        Self::Completion,
    ];

    /// The canonical lowercase name used in scripts and diagnostics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::RecipeFetch => "recipe_fetch",
            Self::Check => "check",
            Self::Fetch => "fetch",
            Self::Stage => "stage",
            Self::Build => "build",
            Self::Install => "install",
            Self::Deploy => "deploy",
            Self::Completion => "completion",
        }
    }

    /// Parse a canonical phase name.
    pub fn parse(name: &str) -> Result<Self, PhaseParseError> {
        match name {
            "none" => Ok(Self::None),
            "recipe_fetch" => Ok(Self::RecipeFetch),
            "check" => Ok(Self::Check),
            "fetch" => Ok(Self::Fetch),
            "stage" => Ok(Self::Stage),
            "build" => Ok(Self::Build),
            "install" => Ok(Self::Install),
            "deploy" => Ok(Self::Deploy),
            "completion" => Ok(Self::Completion),
            _ => Err(PhaseParseError {
                name: name.to_string(),
            }),
        }
    }

    /// The phase that follows this one, or `None` for `Completion`.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::None => Some(Self::RecipeFetch),
            Self::RecipeFetch => Some(Self::Check),
            Self::Check => Some(Self::Fetch),
            Self::Fetch => Some(Self::Stage),
            Self::Stage => Some(Self::Build),
            Self::Build => Some(Self::Install),
            Self::Install => Some(Self::Deploy),
            Self::Deploy => Some(Self::Completion),
            Self::Completion => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
