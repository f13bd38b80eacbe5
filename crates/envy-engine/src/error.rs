//! Engine error taxonomy
//!
//! One kind per failure class. Errors are cloneable so a dependency's
//! failure can be shared with every waiter; collaborator errors are
//! flattened to their display form at the phase boundary, which also keeps
//! the type `Send + Sync` for cross-thread propagation.

use envy_cache::CacheError;
use envy_cfg::CfgError;
use envy_hash::HashError;
use envy_key::KeyError;

/// A package-fatal failure recorded against one package record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvyError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid package cfg: {0}")]
    InvalidCfg(String),

    #[error("dependency cycle: {}", members.join(" -> "))]
    Cycle { members: Vec<String> },

    #[error("cache failure: {0}")]
    Cache(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("extraction failed: {0}")]
    Extract(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("hash mismatch: declared {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("script error: {0}")]
    Script(String),

    #[error("dependency '{key}' failed: {reason}")]
    DependencyFailed { key: String, reason: String },
}

impl From<KeyError> for EnvyError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::InvalidIdentity { .. } => Self::InvalidIdentity(err.to_string()),
            KeyError::InvalidOptions { .. } => Self::InvalidCfg(err.to_string()),
        }
    }
}

impl From<CfgError> for EnvyError {
    fn from(err: CfgError) -> Self {
        match err {
            CfgError::InvalidIdentity(key_err) => key_err.into(),
            other => Self::InvalidCfg(other.to_string()),
        }
    }
}

impl From<CacheError> for EnvyError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err.to_string())
    }
}

impl From<HashError> for EnvyError {
    fn from(err: HashError) -> Self {
        match err {
            HashError::Mismatch { expected, actual } => Self::HashMismatch { expected, actual },
            other => Self::Fetch(other.to_string()),
        }
    }
}
