//! External collaborator interfaces
//!
//! The engine never talks to the network, the scripting runtime, or a
//! terminal directly. Transport, script evaluation, and output rendering
//! arrive through these traits; the engine owns phase ordering, cache
//! locking, verification, and retry policy.

use camino::{Utf8Path, Utf8PathBuf};
use envy_cfg::PackageCfg;
use envy_key::CanonicalKey;
use std::collections::HashMap;
use std::sync::Arc;

use crate::fsops;

/// A dependency's resolved location, as seen by a dependent package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyAsset {
    /// Installed asset directory, or the resolved product path for product
    /// dependencies, or the weak-ref placeholder when content-free.
    pub path: Utf8PathBuf,
    /// BLAKE3 hex of the installed tree; empty until the dependency has
    /// installed (or when it never produces content).
    pub result_hash: String,
}

/// Everything a package script sees while its phases run.
pub struct ScriptContext<'a> {
    pub key: &'a CanonicalKey,
    pub fetch_dir: &'a Utf8Path,
    pub stage_dir: &'a Utf8Path,
    pub install_dir: &'a Utf8Path,
    /// Archive-prefix rule from the cfg, applied by the default stage step.
    pub subdir: Option<&'a str>,
    /// Resolved dependencies, keyed by canonical key string.
    pub dependencies: &'a HashMap<String, DependencyAsset>,
    pub log: &'a dyn BuildLog,
}

/// One package's scripted behavior.
///
/// Loaded once per package during `recipe_fetch` and consulted by the
/// asset-producing phases. Errors returned here are recorded as script or
/// build failures against the package; they never cross package boundaries.
pub trait PackageScript: Send + Sync {
    /// Dependency tables declared by the script, in declaration order.
    fn dependencies(&self) -> anyhow::Result<Vec<serde_json::Value>> {
        Ok(Vec::new())
    }

    /// Populate `fetch_dir` for packages whose cfg declares no engine-side
    /// source download (`fetch_function`, or script-described sources).
    fn fetch(&self, _ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Populate `stage_dir` from `fetch_dir`. The default copies the
    /// fetched tree, honoring the cfg's `subdir` prefix rule.
    fn stage(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        let src = match ctx.subdir {
            Some(subdir) => ctx.fetch_dir.join(subdir),
            None => ctx.fetch_dir.to_path_buf(),
        };
        fsops::copy_tree(&src, ctx.stage_dir)?;
        Ok(())
    }

    /// Produce artifacts in `install_dir` from `stage_dir`. The default
    /// treats the staged tree as the artifact.
    fn build(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        fsops::copy_tree(ctx.stage_dir, ctx.install_dir)?;
        Ok(())
    }

    /// Finalize installed content (permissions, manifests).
    fn install(&self, _ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Named products inside the installed tree: name to a path relative to
    /// `asset/`, or an absolute path for user-managed providers.
    fn products(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// The scripting runtime boundary.
pub trait ScriptHost: Send + Sync {
    /// Run the user-supplied recipe fetch of a `fetch_function` cfg,
    /// populating `dest` with the package's spec file(s).
    fn fetch_recipe(&self, cfg: &PackageCfg, dest: &Utf8Path) -> anyhow::Result<()>;

    /// Evaluate the materialized spec file into a package script.
    fn load(&self, cfg: &PackageCfg, spec_file: &Utf8Path)
    -> anyhow::Result<Arc<dyn PackageScript>>;
}

/// Source transport boundary. Implementations flag retryable failures by
/// wrapping them in [`crate::retry::TransientNetworkError`].
pub trait SourceFetcher: Send + Sync {
    /// Download `url` into `dest`, returning the fetched file's path.
    fn fetch_remote(&self, url: &str, dest: &Utf8Path) -> anyhow::Result<Utf8PathBuf>;

    /// Materialize `url` at `git_ref` into `dest`.
    fn fetch_git(&self, url: &str, git_ref: &str, dest: &Utf8Path) -> anyhow::Result<()>;
}

/// Diagnostics channel: build output lines and enriched failure blocks.
pub trait BuildLog: Send + Sync {
    fn line(&self, key: &CanonicalKey, line: &str);

    fn error_block(&self, block: &str);
}

/// Default log collaborator that forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl BuildLog for TracingLog {
    fn line(&self, key: &CanonicalKey, line: &str) {
        tracing::info!(package = %key, "{line}");
    }

    fn error_block(&self, block: &str) {
        tracing::error!("{block}");
    }
}
