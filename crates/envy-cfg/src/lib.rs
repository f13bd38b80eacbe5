//! Package configuration for the envy engine
//!
//! A `PackageCfg` is the parsed description of one declared package: its
//! identity, where its sources come from, its canonicalized options, and its
//! edges in the dependency graph. Cfgs are immutable once parsed and live in
//! a process-wide append-only pool, so `CfgId` handles stay valid for the
//! engine's whole lifetime and the provenance chain can be walked without
//! ownership cycles.

use camino::{Utf8Path, Utf8PathBuf};
use envy_key::{CanonicalKey, KeyError, canonicalize_options};
use envy_phases::{Phase, PhaseParseError};
use serde_json::Value;

mod pool;

pub use pool::{CfgId, CfgPool};

/// Errors from scripted package-table parsing.
#[derive(Debug, thiserror::Error)]
pub enum CfgError {
    #[error(transparent)]
    InvalidIdentity(#[from] KeyError),

    #[error("package table is not a table")]
    NotATable,

    #[error("required field '{field}' is missing")]
    MissingField { field: &'static str },

    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown field '{field}' in package table")]
    UnknownField { field: String },

    #[error("package declares no source (expected one of remote, local, git, fetch_function, weak_ref)")]
    MissingSource,

    #[error("package declares conflicting sources: {found}")]
    ConflictingSources { found: String },

    #[error("weak_ref source requires allow_weak_without_source")]
    WeakRefNotAllowed,

    #[error("local source file does not exist: {path}")]
    LocalFileMissing { path: Utf8PathBuf },

    #[error("needed_by names an unknown phase: {0}")]
    UnknownPhase(#[from] PhaseParseError),
}

/// Where a package's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// A remote archive, verified against a declared SHA-256.
    Remote {
        url: String,
        sha256: String,
        subdir: Option<String>,
    },
    /// A file on the local filesystem, resolved against the declaring file.
    Local { file_path: Utf8PathBuf },
    /// A git repository at a specific ref.
    Git {
        url: String,
        git_ref: String,
        subdir: Option<String>,
    },
    /// The package script supplies its own fetch step; its raw
    /// source-dependency declarations are validated when scheduled.
    FetchFunction { source_dependencies: Vec<Value> },
    /// A dependency edge with no content of its own.
    WeakRef,
}

impl PackageSource {
    /// Stable identifier of the resolved source, used in the check-phase
    /// input digest.
    #[must_use]
    pub fn identifier(&self) -> String {
        match self {
            Self::Remote { url, sha256, .. } => format!("remote:{url}:{sha256}"),
            Self::Local { file_path } => format!("local:{file_path}"),
            Self::Git { url, git_ref, .. } => format!("git:{url}:{git_ref}"),
            Self::FetchFunction { .. } => "fetch_function".to_string(),
            Self::WeakRef => "weak_ref".to_string(),
        }
    }
}

/// The parsed configuration of one declared package.
#[derive(Debug, Clone)]
pub struct PackageCfg {
    pub identity: String,
    pub source: PackageSource,
    /// Canonical text form of the options table; `"{}"` when none.
    pub serialized_options: String,
    /// Phase at which dependents may stop waiting on this package; absent
    /// means dependents wait for full completion.
    pub needed_by: Option<Phase>,
    /// The cfg that declared this one, for provenance chains.
    pub parent: Option<CfgId>,
    /// Fallback cfg substituted when this one fails.
    pub weak: Option<CfgId>,
    /// Named sub-artifact of the provider when this cfg is a product
    /// dependency.
    pub product: Option<String>,
    /// Absolute path of the manifest file that declared this package.
    pub declaring_file_path: Utf8PathBuf,
}

impl PackageCfg {
    /// The canonical key `identity{options}` for this cfg.
    pub fn canonical_key(&self) -> Result<CanonicalKey, KeyError> {
        CanonicalKey::make(&self.identity, &self.serialized_options)
    }
}

/// Caller-supplied context for [`parse_table`].
#[derive(Debug, Clone)]
pub struct ParseContext {
    /// Absolute path of the file the table came from.
    pub declaring_file: Utf8PathBuf,
    /// Cfg that declared the table, if any; recorded as the parse result's
    /// parent before emission.
    pub parent: Option<CfgId>,
    /// Permit `weak_ref` sources (dependency declarations only).
    pub allow_weak_without_source: bool,
}

const KNOWN_FIELDS: &[&str] = &[
    "identity",
    "remote",
    "local",
    "git",
    "fetch_function",
    "weak_ref",
    "options",
    "needed_by",
    "product",
    "weak",
];

/// Parse and validate a scripted package table, emplacing the result (and
/// any `weak` fallback it declares) into `pool`.
pub fn parse_table(table: &Value, ctx: &ParseContext, pool: &CfgPool) -> Result<CfgId, CfgError> {
    let map = table.as_object().ok_or(CfgError::NotATable)?;

    for field in map.keys() {
        if !KNOWN_FIELDS.contains(&field.as_str()) {
            return Err(CfgError::UnknownField {
                field: field.clone(),
            });
        }
    }

    let identity = require_str(map, "identity")?;
    // Validate the identity shape up front; the options are appended later.
    CanonicalKey::parse(identity)?;

    let source = parse_source(map, ctx)?;

    let serialized_options = match map.get("options") {
        Some(options) => canonicalize_options(options)?,
        None => "{}".to_string(),
    };

    let needed_by = match map.get("needed_by") {
        Some(value) => {
            let name = value.as_str().ok_or_else(|| CfgError::InvalidField {
                field: "needed_by",
                reason: "expected a phase name string".to_string(),
            })?;
            Some(Phase::parse(name)?)
        }
        None => None,
    };

    let product = match map.get("product") {
        Some(value) => {
            let name = value.as_str().ok_or_else(|| CfgError::InvalidField {
                field: "product",
                reason: "expected a string".to_string(),
            })?;
            if name.is_empty() {
                return Err(CfgError::InvalidField {
                    field: "product",
                    reason: "product name is empty".to_string(),
                });
            }
            Some(name.to_string())
        }
        None => None,
    };

    // A weak fallback is its own cfg, sharing this table's provenance. It is
    // linked by a non-owning edge and never mutated afterwards.
    let weak = match map.get("weak") {
        Some(weak_table) => Some(parse_table(weak_table, ctx, pool)?),
        None => None,
    };

    let cfg = PackageCfg {
        identity: identity.to_string(),
        source,
        serialized_options,
        needed_by,
        parent: ctx.parent,
        weak,
        product,
        declaring_file_path: ctx.declaring_file.clone(),
    };

    Ok(pool.emplace(cfg).0)
}

fn require_str<'a>(
    map: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, CfgError> {
    map.get(field)
        .ok_or(CfgError::MissingField { field })?
        .as_str()
        .ok_or_else(|| CfgError::InvalidField {
            field,
            reason: "expected a string".to_string(),
        })
        .and_then(|s| {
            if s.is_empty() {
                Err(CfgError::InvalidField {
                    field,
                    reason: "must not be empty".to_string(),
                })
            } else {
                Ok(s)
            }
        })
}

fn parse_source(
    map: &serde_json::Map<String, Value>,
    ctx: &ParseContext,
) -> Result<PackageSource, CfgError> {
    let declared: Vec<&str> = ["remote", "local", "git", "fetch_function", "weak_ref"]
        .into_iter()
        .filter(|k| map.contains_key(*k))
        .collect();

    match declared.as_slice() {
        [] => Err(CfgError::MissingSource),
        &[single] => parse_single_source(single, map, ctx),
        many => Err(CfgError::ConflictingSources {
            found: many.join(", "),
        }),
    }
}

fn parse_single_source(
    kind: &str,
    map: &serde_json::Map<String, Value>,
    ctx: &ParseContext,
) -> Result<PackageSource, CfgError> {
    match kind {
        "remote" => {
            let remote = map["remote"]
                .as_object()
                .ok_or_else(|| CfgError::InvalidField {
                    field: "remote",
                    reason: "expected a table".to_string(),
                })?;
            let url = require_str(remote, "url")?;
            let sha256 = require_str(remote, "sha256")?;
            envy_hash::validate_sha256_hex(sha256).map_err(|e| CfgError::InvalidField {
                field: "sha256",
                reason: e.to_string(),
            })?;
            let subdir = parse_subdir(remote)?;
            Ok(PackageSource::Remote {
                url: url.to_string(),
                sha256: sha256.to_string(),
                subdir,
            })
        }
        "local" => {
            let local = map["local"]
                .as_object()
                .ok_or_else(|| CfgError::InvalidField {
                    field: "local",
                    reason: "expected a table".to_string(),
                })?;
            let raw = require_str(local, "file_path")?;
            let file_path = resolve_local_path(raw, &ctx.declaring_file);
            if !file_path.exists() {
                return Err(CfgError::LocalFileMissing { path: file_path });
            }
            Ok(PackageSource::Local { file_path })
        }
        "git" => {
            let git = map["git"]
                .as_object()
                .ok_or_else(|| CfgError::InvalidField {
                    field: "git",
                    reason: "expected a table".to_string(),
                })?;
            let url = require_str(git, "url")?;
            let git_ref = require_str(git, "ref")?;
            let subdir = parse_subdir(git)?;
            Ok(PackageSource::Git {
                url: url.to_string(),
                git_ref: git_ref.to_string(),
                subdir,
            })
        }
        "fetch_function" => {
            let source_dependencies = match map["fetch_function"].as_object() {
                Some(ff) => match ff.get("source_dependencies") {
                    Some(Value::Array(deps)) => deps.clone(),
                    Some(_) => {
                        return Err(CfgError::InvalidField {
                            field: "fetch_function",
                            reason: "source_dependencies must be an array of tables".to_string(),
                        });
                    }
                    None => Vec::new(),
                },
                None => Vec::new(),
            };
            Ok(PackageSource::FetchFunction {
                source_dependencies,
            })
        }
        "weak_ref" => {
            if ctx.allow_weak_without_source {
                Ok(PackageSource::WeakRef)
            } else {
                Err(CfgError::WeakRefNotAllowed)
            }
        }
        _ => unreachable!("parse_source filters to known source kinds"),
    }
}

fn parse_subdir(map: &serde_json::Map<String, Value>) -> Result<Option<String>, CfgError> {
    let Some(value) = map.get("subdir") else {
        return Ok(None);
    };
    let raw = value.as_str().ok_or_else(|| CfgError::InvalidField {
        field: "subdir",
        reason: "expected a string".to_string(),
    })?;
    let normalized = raw.replace('\\', "/");
    if normalized.split('/').any(|seg| seg == "..") {
        return Err(CfgError::InvalidField {
            field: "subdir",
            reason: "must not contain '..' segments".to_string(),
        });
    }
    Ok(Some(normalized.trim_matches('/').to_string()))
}

/// Resolve a declared local path against the declaring file's directory.
fn resolve_local_path(raw: &str, declaring_file: &Utf8Path) -> Utf8PathBuf {
    let raw = Utf8Path::new(raw);
    if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        declaring_file
            .parent()
            .unwrap_or(Utf8Path::new("."))
            .join(raw)
    }
}
