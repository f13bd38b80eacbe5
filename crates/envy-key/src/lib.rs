//! Canonical package keys for the envy engine
//!
//! A canonical key is the immutable string `ns.name@rev{opt=val,...}` that
//! uniquely identifies a package together with its serialized options. Two
//! packages are the same package iff their canonical keys are byte-equal.
//! The trailing `{}` is elided when a package has no options.

use std::fmt;
use std::hash::{Hash, Hasher};

pub mod options;

pub use options::canonicalize_options;

/// Errors produced while constructing or parsing canonical keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid identity '{identity}': {reason}")]
    InvalidIdentity { identity: String, reason: String },

    #[error("options table cannot be canonicalized: {reason}")]
    InvalidOptions { reason: String },
}

/// Returns true when a serialized options string denotes "no options".
#[must_use]
pub fn options_are_empty(serialized: &str) -> bool {
    serialized.is_empty() || serialized == "{}"
}

/// A validated canonical key.
///
/// The key owns its backing string; all component accessors are views over
/// that string. The hash of the backing string is computed once at
/// construction, so keys are cheap to use in concurrent maps.
///
/// # Structure
///
/// ```text
/// zlib.ng@2.2.1{simd=true}
/// └┬─┘ └┬┘└─┬─┘└────┬────┘
///  ns  name  rev  options (elided when empty)
/// └───identity────┘
/// ```
#[derive(Debug, Clone)]
pub struct CanonicalKey {
    canonical: String,
    /// Byte offset of the name component (just past `ns.`).
    name_start: usize,
    /// Byte offset of the `@` that starts the revision.
    rev_start: usize,
    /// Byte offset of the `{` that starts the options, if present.
    opts_start: Option<usize>,
    cached_hash: u64,
}

impl CanonicalKey {
    /// Build a key from a validated identity and a serialized options table.
    ///
    /// Returns the bare identity when `serialized_options` is empty or `{}`,
    /// otherwise `identity{...}`.
    pub fn make(identity: &str, serialized_options: &str) -> Result<Self, KeyError> {
        if options_are_empty(serialized_options) {
            Self::parse(identity)
        } else {
            Self::parse(&format!("{identity}{serialized_options}"))
        }
    }

    /// Parse and validate a canonical key string.
    pub fn parse(canonical: &str) -> Result<Self, KeyError> {
        let invalid = |reason: &str| KeyError::InvalidIdentity {
            identity: canonical.to_string(),
            reason: reason.to_string(),
        };

        let (identity, opts_start) = match canonical.find('{') {
            Some(pos) => {
                let opts = &canonical[pos..];
                if !opts.ends_with('}') {
                    return Err(invalid("options are not brace-terminated"));
                }
                (&canonical[..pos], Some(pos))
            }
            None => (canonical, None),
        };

        let dot = identity
            .find('.')
            .ok_or_else(|| invalid("missing '.' namespace separator"))?;
        if dot == 0 {
            return Err(invalid("namespace is empty"));
        }

        let name_start = dot + 1;
        let at = identity[name_start..]
            .find('@')
            .map(|off| name_start + off)
            .ok_or_else(|| invalid("missing '@' revision separator"))?;
        if at == name_start {
            return Err(invalid("name is empty"));
        }
        if at + 1 == identity.len() {
            return Err(invalid("revision is empty"));
        }

        let mut hasher = std::hash::DefaultHasher::new();
        canonical.hash(&mut hasher);

        Ok(Self {
            canonical: canonical.to_string(),
            name_start,
            rev_start: at,
            opts_start,
            cached_hash: hasher.finish(),
        })
    }

    /// The full canonical string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The `ns.name@rev` prefix, without options.
    #[must_use]
    pub fn identity(&self) -> &str {
        match self.opts_start {
            Some(pos) => &self.canonical[..pos],
            None => &self.canonical,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.canonical[..self.name_start - 1]
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.canonical[self.name_start..self.rev_start]
    }

    /// The revision component, including its leading `@`.
    #[must_use]
    pub fn revision(&self) -> &str {
        match self.opts_start {
            Some(pos) => &self.canonical[self.rev_start..pos],
            None => &self.canonical[self.rev_start..],
        }
    }

    /// The serialized options, or `""` when the key has none.
    #[must_use]
    pub fn options(&self) -> &str {
        match self.opts_start {
            Some(pos) => &self.canonical[pos..],
            None => "",
        }
    }

    /// Match this key against a partial query.
    ///
    /// Queries may supply any of the forms `name`, `ns.name`, `name@rev`,
    /// `ns.name@rev`, or the full canonical string. Provided components must
    /// match exactly; omitted components match anything.
    #[must_use]
    pub fn matches(&self, query: &str) -> bool {
        let Ok(query) = PartialQuery::parse(query) else {
            return false;
        };
        query.matches(self)
    }
}

impl PartialEq for CanonicalKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for CanonicalKey {}

impl Hash for CanonicalKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.cached_hash);
    }
}

impl PartialOrd for CanonicalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonicalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// A parsed partial query for [`CanonicalKey::matches`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialQuery {
    pub namespace: Option<String>,
    pub name: String,
    /// Revision including its leading `@`.
    pub revision: Option<String>,
    pub options: Option<String>,
}

impl PartialQuery {
    /// Split a query string into its provided components.
    pub fn parse(query: &str) -> Result<Self, KeyError> {
        let invalid = |reason: &str| KeyError::InvalidIdentity {
            identity: query.to_string(),
            reason: reason.to_string(),
        };

        let (head, options) = match query.find('{') {
            Some(pos) => {
                if !query.ends_with('}') {
                    return Err(invalid("options are not brace-terminated"));
                }
                (&query[..pos], Some(query[pos..].to_string()))
            }
            None => (query, None),
        };

        let (head, revision) = match head.find('@') {
            Some(pos) => {
                if pos + 1 == head.len() {
                    return Err(invalid("revision is empty"));
                }
                (&head[..pos], Some(head[pos..].to_string()))
            }
            None => (head, None),
        };

        let (namespace, name) = match head.find('.') {
            Some(pos) => {
                if pos == 0 {
                    return Err(invalid("namespace is empty"));
                }
                (Some(head[..pos].to_string()), head[pos + 1..].to_string())
            }
            None => (None, head.to_string()),
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }

        Ok(Self {
            namespace,
            name,
            revision,
            options,
        })
    }

    /// Component-wise exact matching; omitted components wildcard-match.
    #[must_use]
    pub fn matches(&self, key: &CanonicalKey) -> bool {
        if self.name != key.name() {
            return false;
        }
        if let Some(ns) = &self.namespace {
            if ns != key.namespace() {
                return false;
            }
        }
        if let Some(rev) = &self.revision {
            if rev != key.revision() {
                return false;
            }
        }
        if let Some(opts) = &self.options {
            let key_opts = if key.options().is_empty() {
                "{}"
            } else {
                key.options()
            };
            let query_opts = if opts.is_empty() { "{}" } else { opts.as_str() };
            if query_opts != key_opts {
                return false;
            }
        }
        true
    }
}
