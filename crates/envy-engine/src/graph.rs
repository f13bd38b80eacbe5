//! Package graph construction and phase scheduling
//!
//! One worker thread drives each package record through its phases in enum
//! order. Cross-package ordering exists only at the dependency join point:
//! before `check`, a dependent blocks until each declared dependency has
//! reached its `needed_by` phase (or `completion` when absent). Everything
//! else runs concurrently, and the engine waits for quiescence by joining
//! every spawned worker.
//!
//! Lock discipline: a worker resolves its dependencies *before* acquiring
//! its asset entry lock, and the recipe entry lock is released inside
//! `recipe_fetch`, so no worker ever blocks on another record while holding
//! an entry lock.

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use envy_cache::{Cache, Entry};
use envy_cfg::{CfgId, CfgPool, PackageCfg, PackageSource, ParseContext, parse_table};
use envy_key::CanonicalKey;
use envy_phases::Phase;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::EngineOptions;
use crate::collab::{BuildLog, DependencyAsset, ScriptContext, ScriptHost, SourceFetcher};
use crate::error::EnvyError;
use crate::record::PackageRecord;
use crate::retry::with_retries;
use crate::{fsops, report};

/// Shared state for one engine run.
pub(crate) struct Graph {
    pub(crate) records: DashMap<String, Arc<PackageRecord>>,
    pub(crate) pool: CfgPool,
    cache: Cache,
    host: Arc<dyn ScriptHost>,
    fetcher: Arc<dyn SourceFetcher>,
    log: Arc<dyn BuildLog>,
    options: EngineOptions,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Driver-local state carried across one record's phases.
struct DriveState {
    script: Option<Arc<dyn crate::collab::PackageScript>>,
    /// Declared dependency edges, in declaration order.
    declared: Vec<(CfgId, String)>,
    /// Resolved dependency assets, keyed by canonical key string.
    deps: HashMap<String, DependencyAsset>,
    /// Scratch paths of the held asset entry.
    paths: Option<EntryPaths>,
    /// Cache hit in `check`: jump straight to deploy.
    skip_to_deploy: bool,
}

struct EntryPaths {
    fetch: Utf8PathBuf,
    stage: Utf8PathBuf,
    install: Utf8PathBuf,
}

impl Graph {
    pub(crate) fn new(
        cache: Cache,
        host: Arc<dyn ScriptHost>,
        fetcher: Arc<dyn SourceFetcher>,
        log: Arc<dyn BuildLog>,
        options: EngineOptions,
    ) -> Self {
        Self {
            records: DashMap::new(),
            pool: CfgPool::new(),
            cache,
            host,
            fetcher,
            log,
            options,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Find or create the record for `cfg` and make sure its target covers
    /// `target`. New records get a dedicated worker thread.
    pub(crate) fn spawn_package(
        self: &Arc<Self>,
        cfg_id: CfgId,
        cfg: Arc<PackageCfg>,
        ancestors: Arc<Vec<String>>,
        target: Phase,
    ) -> Result<Arc<PackageRecord>, EnvyError> {
        let key = cfg.canonical_key()?;

        let record = match self.records.entry(key.to_string()) {
            MapEntry::Occupied(occupied) => {
                let record = Arc::clone(occupied.get());
                drop(occupied);
                record.request_target(target);
                return Ok(record);
            }
            MapEntry::Vacant(vacant) => {
                let record = Arc::new(PackageRecord::new(key, cfg_id, cfg, target));
                vacant.insert(Arc::clone(&record));
                record
            }
        };

        let graph = Arc::clone(self);
        let worker_record = Arc::clone(&record);
        let handle = std::thread::Builder::new()
            .name(format!("envy-{}", record.key().identity()))
            .spawn(move || drive(&graph, &worker_record, &ancestors))
            .map_err(|err| EnvyError::Cache(format!("failed to spawn package worker: {err}")))?;
        self.workers.lock().push(handle);

        Ok(record)
    }

    /// Join every worker, including workers spawned while joining.
    pub(crate) fn wait_quiescence(&self) {
        loop {
            let handle = self.workers.lock().pop();
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }
    }
}

/// Worker loop: run phases up to the current target, then sleep until the
/// target is promoted. In practice every spawn requests `completion`, so
/// the loop runs straight through; the wait keeps promotion observable.
fn drive(graph: &Arc<Graph>, record: &Arc<PackageRecord>, ancestors: &Arc<Vec<String>>) {
    let mut state = DriveState {
        script: None,
        declared: Vec::new(),
        deps: HashMap::new(),
        paths: None,
        skip_to_deploy: false,
    };

    loop {
        let target = record.target_phase();
        while record.current_phase() < target {
            let phase = next_phase(record, state.skip_to_deploy);
            tracing::debug!(package = %record.key(), %phase, "entering phase");
            match run_phase(graph, record, ancestors, &mut state, phase) {
                Ok(()) => record.advance_to(phase),
                Err(error) => {
                    report_failure(graph, record, phase, error);
                    return;
                }
            }
        }
        if record.current_phase() >= Phase::Completion {
            return;
        }
        record.wait_for_target_above(target);
        if record.error().is_some() {
            return;
        }
    }
}

fn next_phase(record: &PackageRecord, skip_to_deploy: bool) -> Phase {
    let current = record.current_phase();
    if skip_to_deploy && current == Phase::Check {
        // Cache fast path: the asset already exists.
        Phase::Deploy
    } else {
        current.next().unwrap_or(Phase::Completion)
    }
}

fn report_failure(graph: &Graph, record: &PackageRecord, phase: Phase, error: EnvyError) {
    let error = Arc::new(error);
    record.fail(Arc::clone(&error));
    let block = report::format_failure(
        record.key(),
        phase,
        &error.to_string(),
        record.cfg(),
        &graph.pool,
    );
    graph.log.error_block(&block);
    tracing::warn!(package = %record.key(), %phase, %error, "package failed");
}

fn run_phase(
    graph: &Arc<Graph>,
    record: &Arc<PackageRecord>,
    ancestors: &Arc<Vec<String>>,
    state: &mut DriveState,
    phase: Phase,
) -> Result<(), EnvyError> {
    match phase {
        Phase::RecipeFetch => recipe_fetch(graph, record, ancestors, state),
        Phase::Check => check(graph, record, state),
        Phase::Fetch => fetch(graph, record, state),
        Phase::Stage => stage(graph, record, state),
        Phase::Build => build(graph, record, state),
        Phase::Install => install(graph, record, state),
        Phase::Deploy => deploy(graph, record, state),
        Phase::None | Phase::Completion => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// recipe_fetch
// ---------------------------------------------------------------------------

fn recipe_fetch(
    graph: &Arc<Graph>,
    record: &Arc<PackageRecord>,
    ancestors: &Arc<Vec<String>>,
    state: &mut DriveState,
) -> Result<(), EnvyError> {
    let cfg = Arc::clone(record.cfg());
    match &cfg.source {
        PackageSource::WeakRef => Ok(()),
        PackageSource::FetchFunction {
            source_dependencies,
        } => {
            // Source dependencies must be fully complete before the user
            // fetch can run.
            let mut pending = Vec::new();
            for table in source_dependencies {
                let parse_ctx = ParseContext {
                    declaring_file: cfg.declaring_file_path.clone(),
                    parent: Some(record.cfg_id()),
                    allow_weak_without_source: true,
                };
                let dep_id = parse_table(table, &parse_ctx, &graph.pool)?;
                let dep_cfg = lookup_cfg(graph, dep_id)?;
                pending.push(spawn_dependency(graph, ancestors, dep_id, &dep_cfg)?);
            }
            for (dep_record, _) in &pending {
                dep_record
                    .wait_for_phase(Phase::Completion)
                    .map_err(|err| dependency_failure(&cfg, dep_record.key(), &err))?;
            }

            let spec_file = materialize_recipe(graph, &cfg)?;
            load_script(graph, record, ancestors, state, &cfg, &spec_file)
        }
        PackageSource::Remote { .. } | PackageSource::Local { .. } | PackageSource::Git { .. } => {
            let spec_file = materialize_recipe(graph, &cfg)?;
            load_script(graph, record, ancestors, state, &cfg, &spec_file)
        }
    }
}

/// True when the cfg's source locates a script file rather than content.
fn source_is_script(source: &PackageSource) -> bool {
    match source {
        PackageSource::Remote { url, .. } => url.ends_with(".lua"),
        PackageSource::Local { file_path } => file_path.extension() == Some("lua"),
        PackageSource::Git { subdir, .. } => {
            subdir.as_deref().is_some_and(|s| s.ends_with(".lua"))
        }
        PackageSource::FetchFunction { .. } | PackageSource::WeakRef => false,
    }
}

/// Ensure the `recipes/<identity>.lua` entry and return the spec file path.
///
/// Script sources are fetched and verified into the entry. Content sources
/// are self-describing: the declaring manifest is the spec file, and a copy
/// of it is cached so the entry always exists.
fn materialize_recipe(graph: &Graph, cfg: &Arc<PackageCfg>) -> Result<Utf8PathBuf, EnvyError> {
    let spec_name = format!("{}.lua", cfg.identity);

    let entry = graph.cache.ensure_recipe(&cfg.identity)?;
    let asset_dir = match entry {
        Entry::Complete { entry_path } => entry_path.join("asset"),
        Entry::Pending(mut guard) => {
            let install_file = guard.install_path().join(&spec_name);
            match &cfg.source {
                PackageSource::Remote { url, sha256, .. } if source_is_script(&cfg.source) => {
                    let fetched = fetch_remote_with_retry(graph, url, &guard.fetch_path())?;
                    let digest = envy_hash::sha256_file(&fetched)?;
                    envy_hash::sha256_verify(sha256, &digest)?;
                    copy_file(&fetched, &install_file)?;
                }
                PackageSource::Git {
                    url,
                    git_ref,
                    subdir,
                } if source_is_script(&cfg.source) => {
                    fetch_git_with_retry(graph, url, git_ref, &guard.fetch_path())?;
                    let subdir = subdir.as_deref().unwrap_or_default();
                    copy_file(&guard.fetch_path().join(subdir), &install_file)?;
                }
                PackageSource::Local { file_path } if source_is_script(&cfg.source) => {
                    copy_file(file_path, &install_file)?;
                }
                PackageSource::FetchFunction { .. } => {
                    graph
                        .host
                        .fetch_recipe(cfg, &guard.fetch_path())
                        .map_err(|err| EnvyError::Script(format!("{err:#}")))?;
                    fsops::copy_tree(&guard.fetch_path(), &guard.install_path())
                        .map_err(|err| EnvyError::Cache(err.to_string()))?;
                }
                _ => {
                    // Content source: the declaration itself is the spec.
                    copy_file(&cfg.declaring_file_path, &install_file)?;
                }
            }
            guard.mark_complete();
            let asset = guard.asset_path();
            drop(guard);
            asset
        }
    };

    spec_file_in(&asset_dir, &cfg.identity)
}

/// Locate the spec file inside a committed recipe entry.
fn spec_file_in(asset_dir: &Utf8Path, identity: &str) -> Result<Utf8PathBuf, EnvyError> {
    let preferred = asset_dir.join(format!("{identity}.lua"));
    if preferred.is_file() {
        return Ok(preferred);
    }
    let entries = asset_dir
        .read_dir_utf8()
        .map_err(|err| EnvyError::Cache(err.to_string()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension() == Some("lua") && path.is_file() {
            return Ok(path.to_path_buf());
        }
    }
    Err(EnvyError::InvalidCfg(format!(
        "recipe entry for '{identity}' contains no spec file"
    )))
}

fn load_script(
    graph: &Arc<Graph>,
    record: &Arc<PackageRecord>,
    ancestors: &Arc<Vec<String>>,
    state: &mut DriveState,
    cfg: &Arc<PackageCfg>,
    spec_file: &Utf8Path,
) -> Result<(), EnvyError> {
    let script = graph
        .host
        .load(cfg, spec_file)
        .map_err(|err| EnvyError::Script(format!("{err:#}")))?;

    let tables = script
        .dependencies()
        .map_err(|err| EnvyError::Script(format!("{err:#}")))?;

    let mut declared_keys = Vec::new();
    for table in &tables {
        let parse_ctx = ParseContext {
            declaring_file: spec_file.to_path_buf(),
            parent: Some(record.cfg_id()),
            allow_weak_without_source: true,
        };
        let dep_id = parse_table(table, &parse_ctx, &graph.pool)?;
        let dep_cfg = lookup_cfg(graph, dep_id)?;
        let (dep_record, _) = spawn_dependency(graph, ancestors, dep_id, &dep_cfg)?;
        declared_keys.push(dep_record.key().clone());
        state.declared.push((dep_id, dep_record.key().to_string()));
    }

    record.set_declared_dependencies(declared_keys);
    state.script = Some(script);
    Ok(())
}

/// Cycle-check, spawn, and link one declared dependency (and its weak
/// fallback, when present).
fn spawn_dependency(
    graph: &Arc<Graph>,
    ancestors: &Arc<Vec<String>>,
    dep_id: CfgId,
    dep_cfg: &Arc<PackageCfg>,
) -> Result<(Arc<PackageRecord>, Option<Arc<PackageRecord>>), EnvyError> {
    if let Some(pos) = ancestors.iter().position(|a| *a == dep_cfg.identity) {
        return Err(EnvyError::Cycle {
            members: ancestors[pos..].to_vec(),
        });
    }

    let weak_record = match dep_cfg.weak {
        Some(weak_id) => {
            let weak_cfg = lookup_cfg(graph, weak_id)?;
            if ancestors.iter().any(|a| *a == weak_cfg.identity) {
                return Err(EnvyError::Cycle {
                    members: ancestors.as_ref().clone(),
                });
            }
            let weak_ancestors = child_ancestors(ancestors, &weak_cfg.identity);
            Some(graph.spawn_package(weak_id, weak_cfg, weak_ancestors, Phase::Completion)?)
        }
        None => None,
    };

    let dep_ancestors = child_ancestors(ancestors, &dep_cfg.identity);
    let dep_record =
        graph.spawn_package(dep_id, Arc::clone(dep_cfg), dep_ancestors, Phase::Completion)?;

    Ok((dep_record, weak_record))
}

fn child_ancestors(ancestors: &Arc<Vec<String>>, identity: &str) -> Arc<Vec<String>> {
    let mut chain = ancestors.as_ref().clone();
    chain.push(identity.to_string());
    Arc::new(chain)
}

fn lookup_cfg(graph: &Graph, id: CfgId) -> Result<Arc<PackageCfg>, EnvyError> {
    graph
        .pool
        .get(id)
        .ok_or_else(|| EnvyError::InvalidCfg("cfg pool lookup failed".to_string()))
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

fn check(
    graph: &Arc<Graph>,
    record: &Arc<PackageRecord>,
    state: &mut DriveState,
) -> Result<(), EnvyError> {
    let cfg = Arc::clone(record.cfg());

    // Dependency join point: block until each declared dependency has
    // reached its needed_by phase (or completion when unspecified).
    for (dep_id, dep_key) in &state.declared {
        let dep_cfg = lookup_cfg(graph, *dep_id)?;
        let asset = resolve_dependency(graph, &cfg, &dep_cfg)?;
        state.deps.insert(dep_key.clone(), asset);
    }

    if cfg.source == PackageSource::WeakRef {
        // Edge-only package: no asset entry to probe or produce.
        return Ok(());
    }

    let digest = input_digest(record.key(), &cfg.source, &state.declared, &state.deps);
    let prefix = &digest[..16];

    match graph
        .cache
        .ensure_asset(&cfg.identity, &graph.options.platform, &graph.options.arch, prefix)?
    {
        Entry::Complete { entry_path } => {
            let asset = entry_path.join("asset");
            let tree = envy_hash::blake3_tree(&asset)?;
            record.set_result_hash(hex::encode(tree));
            record.set_asset_path(asset);
            state.skip_to_deploy = true;
        }
        Entry::Pending(guard) => {
            state.paths = Some(EntryPaths {
                fetch: guard.fetch_path(),
                stage: guard.stage_path(),
                install: guard.install_path(),
            });
            record.hold_entry(guard);
        }
    }
    Ok(())
}

/// Stable digest naming the asset entry: canonical key, resolved source
/// identifier, and the declared dependencies' result-hash snapshot.
fn input_digest(
    key: &CanonicalKey,
    source: &PackageSource,
    declared: &[(CfgId, String)],
    deps: &HashMap<String, DependencyAsset>,
) -> String {
    let mut input = Vec::new();
    input.extend_from_slice(key.as_str().as_bytes());
    input.push(0);
    input.extend_from_slice(source.identifier().as_bytes());
    input.push(0);
    for (_, dep_key) in declared {
        if let Some(asset) = deps.get(dep_key) {
            input.extend_from_slice(asset.result_hash.as_bytes());
        }
        input.push(0);
    }
    hex::encode(envy_hash::sha256_bytes(&input))
}

fn resolve_dependency(
    graph: &Graph,
    dependent: &Arc<PackageCfg>,
    dep_cfg: &Arc<PackageCfg>,
) -> Result<DependencyAsset, EnvyError> {
    let dep_key = dep_cfg.canonical_key()?;
    let dep_record = graph
        .records
        .get(dep_key.as_str())
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| {
            EnvyError::InvalidCfg(format!("dependency '{dep_key}' was never scheduled"))
        })?;

    let mut needed = dep_cfg.needed_by.unwrap_or(Phase::Completion);
    if dep_cfg.product.is_some() {
        // Product names resolve against the provider's deployed tree.
        needed = needed.max(Phase::Deploy);
    }

    match dep_record.wait_for_phase(needed) {
        Ok(()) => snapshot_dependency(&dep_record, dep_cfg),
        Err(primary_err) => {
            if let Some(weak_id) = dep_cfg.weak {
                if let Some(weak_cfg) = graph.pool.get(weak_id) {
                    if let Some(asset) = try_weak_fallback(graph, &dep_key, &weak_cfg) {
                        return Ok(asset);
                    }
                }
            }
            Err(dependency_failure(dependent, &dep_key, &primary_err))
        }
    }
}

/// Weak fallback: usable only if the weak package itself succeeded.
fn try_weak_fallback(
    graph: &Graph,
    primary_key: &CanonicalKey,
    weak_cfg: &Arc<PackageCfg>,
) -> Option<DependencyAsset> {
    let weak_key = weak_cfg.canonical_key().ok()?;
    let weak_record = graph
        .records
        .get(weak_key.as_str())
        .map(|entry| Arc::clone(entry.value()))?;
    weak_record.wait_for_phase(Phase::Completion).ok()?;
    tracing::warn!(
        primary = %primary_key,
        fallback = %weak_key,
        "primary dependency failed, substituting weak fallback"
    );
    snapshot_dependency(&weak_record, weak_cfg).ok()
}

fn snapshot_dependency(
    dep_record: &PackageRecord,
    dep_cfg: &Arc<PackageCfg>,
) -> Result<DependencyAsset, EnvyError> {
    let result_hash = dep_record.result_hash();
    let asset_path = dep_record.asset_path();

    if let Some(product) = &dep_cfg.product {
        let value = dep_record.product(product).ok_or_else(|| {
            EnvyError::InvalidCfg(format!(
                "provider '{}' declares no product '{product}'",
                dep_record.key()
            ))
        })?;
        let path = if Utf8Path::new(&value).is_absolute() {
            // User-managed provider: raw value passes through.
            Utf8PathBuf::from(value)
        } else {
            asset_path
                .ok_or_else(|| {
                    EnvyError::InvalidCfg(format!(
                        "provider '{}' has no asset path for product '{product}'",
                        dep_record.key()
                    ))
                })?
                .join(value)
        };
        return Ok(DependencyAsset { path, result_hash });
    }

    Ok(DependencyAsset {
        path: asset_path.unwrap_or_default(),
        result_hash,
    })
}

fn dependency_failure(
    dependent: &Arc<PackageCfg>,
    dep_key: &CanonicalKey,
    err: &Arc<EnvyError>,
) -> EnvyError {
    if let EnvyError::Cycle { members } = err.as_ref() {
        if members.iter().any(|m| *m == dependent.identity) {
            // Both ends of a cycle report the cycle itself.
            return EnvyError::Cycle {
                members: members.clone(),
            };
        }
    }
    EnvyError::DependencyFailed {
        key: dep_key.to_string(),
        reason: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// fetch / stage / build / install
// ---------------------------------------------------------------------------

fn fetch(
    graph: &Arc<Graph>,
    record: &Arc<PackageRecord>,
    state: &mut DriveState,
) -> Result<(), EnvyError> {
    let cfg = Arc::clone(record.cfg());
    if cfg.source == PackageSource::WeakRef {
        return Ok(());
    }

    if source_is_script(&cfg.source) || matches!(cfg.source, PackageSource::FetchFunction { .. }) {
        // Script-described sources: the script populates the fetch area.
        return with_script(graph, record, state, |script, ctx| script.fetch(ctx))
            .map_err(EnvyError::Fetch);
    }

    let fetch_dir = entry_paths(state)?.fetch.clone();
    match &cfg.source {
        PackageSource::Remote { url, sha256, .. } => {
            let fetched = fetch_remote_with_retry(graph, url, &fetch_dir)?;
            let digest = envy_hash::sha256_file(&fetched)?;
            envy_hash::sha256_verify(sha256, &digest)?;
            Ok(())
        }
        PackageSource::Git { url, git_ref, .. } => {
            fetch_git_with_retry(graph, url, git_ref, &fetch_dir)
        }
        PackageSource::Local { file_path } => {
            let file_name = file_path.file_name().unwrap_or("source");
            copy_file(file_path, &fetch_dir.join(file_name))
        }
        PackageSource::FetchFunction { .. } | PackageSource::WeakRef => Ok(()),
    }
}

fn stage(
    graph: &Arc<Graph>,
    record: &Arc<PackageRecord>,
    state: &mut DriveState,
) -> Result<(), EnvyError> {
    if record.cfg().source == PackageSource::WeakRef {
        return Ok(());
    }
    with_script(graph, record, state, |script, ctx| script.stage(ctx))
        .map_err(EnvyError::Extract)
}

fn build(
    graph: &Arc<Graph>,
    record: &Arc<PackageRecord>,
    state: &mut DriveState,
) -> Result<(), EnvyError> {
    if record.cfg().source == PackageSource::WeakRef {
        return Ok(());
    }
    with_script(graph, record, state, |script, ctx| script.build(ctx)).map_err(EnvyError::Build)
}

fn install(
    graph: &Arc<Graph>,
    record: &Arc<PackageRecord>,
    state: &mut DriveState,
) -> Result<(), EnvyError> {
    if record.cfg().source == PackageSource::WeakRef {
        return Ok(());
    }
    with_script(graph, record, state, |script, ctx| script.install(ctx))
        .map_err(EnvyError::Build)?;

    let install_dir = entry_paths(state)?.install.clone();
    let tree = envy_hash::blake3_tree(&install_dir)?;
    record.set_result_hash(hex::encode(tree));
    Ok(())
}

fn deploy(
    _graph: &Arc<Graph>,
    record: &Arc<PackageRecord>,
    state: &mut DriveState,
) -> Result<(), EnvyError> {
    if let Some(script) = &state.script {
        record.set_products(script.products());
    }

    if state.skip_to_deploy || record.cfg().source == PackageSource::WeakRef {
        // Asset path and result hash were published in check, or the
        // package is edge-only and has neither.
        return Ok(());
    }

    let mut guard = record.take_entry().ok_or_else(|| {
        EnvyError::Cache("entry lock missing at deploy".to_string())
    })?;
    let asset = guard.asset_path();
    guard.mark_complete();
    drop(guard);
    record.set_asset_path(asset);
    Ok(())
}

/// Run one script step with a fully populated context. Returns the
/// flattened collaborator error for the caller to classify.
fn with_script(
    graph: &Arc<Graph>,
    record: &Arc<PackageRecord>,
    state: &mut DriveState,
    step: impl FnOnce(
        &Arc<dyn crate::collab::PackageScript>,
        &ScriptContext<'_>,
    ) -> anyhow::Result<()>,
) -> Result<(), String> {
    let script = state
        .script
        .as_ref()
        .ok_or_else(|| "package script missing".to_string())?;
    let paths = state
        .paths
        .as_ref()
        .ok_or_else(|| "entry paths missing".to_string())?;

    let cfg = record.cfg();
    let subdir = match &cfg.source {
        PackageSource::Remote { subdir, .. } | PackageSource::Git { subdir, .. } => {
            subdir.as_deref()
        }
        _ => None,
    };

    let ctx = ScriptContext {
        key: record.key(),
        fetch_dir: &paths.fetch,
        stage_dir: &paths.stage,
        install_dir: &paths.install,
        subdir,
        dependencies: &state.deps,
        log: graph.log.as_ref(),
    };

    step(script, &ctx).map_err(|err| format!("{err:#}"))
}

fn entry_paths(state: &DriveState) -> Result<&EntryPaths, EnvyError> {
    state
        .paths
        .as_ref()
        .ok_or_else(|| EnvyError::Cache("entry paths missing".to_string()))
}

fn fetch_remote_with_retry(
    graph: &Graph,
    url: &str,
    dest: &Utf8Path,
) -> Result<Utf8PathBuf, EnvyError> {
    with_retries(
        graph.options.fetch_attempts,
        graph.options.backoff_base,
        |_| graph.fetcher.fetch_remote(url, dest),
    )
}

fn fetch_git_with_retry(
    graph: &Graph,
    url: &str,
    git_ref: &str,
    dest: &Utf8Path,
) -> Result<(), EnvyError> {
    with_retries(
        graph.options.fetch_attempts,
        graph.options.backoff_base,
        |_| graph.fetcher.fetch_git(url, git_ref, dest),
    )
}

fn copy_file(src: &Utf8Path, dest: &Utf8Path) -> Result<(), EnvyError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| EnvyError::Cache(format!("create {parent}: {err}")))?;
    }
    fs::copy(src, dest)
        .map_err(|err| EnvyError::Fetch(format!("copy {src} to {dest}: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pooled_ids(identities: &[&str]) -> Vec<CfgId> {
        let pool = CfgPool::new();
        identities
            .iter()
            .map(|identity| {
                pool.emplace(PackageCfg {
                    identity: (*identity).to_string(),
                    source: PackageSource::WeakRef,
                    serialized_options: "{}".to_string(),
                    needed_by: None,
                    parent: None,
                    weak: None,
                    product: None,
                    declaring_file_path: Utf8PathBuf::from("/manifest.lua"),
                })
                .0
            })
            .collect()
    }

    #[test]
    fn input_digest_is_order_stable() {
        let key = CanonicalKey::parse("a.tool@1").unwrap();
        let source = PackageSource::Remote {
            url: "https://example/tool.tar.gz".to_string(),
            sha256: "ab".repeat(32),
            subdir: None,
        };
        let ids = pooled_ids(&["a.dep@1", "a.other@1"]);
        let declared = vec![
            (ids[0], "a.dep@1".to_string()),
            (ids[1], "a.other@1".to_string()),
        ];
        let mut deps = HashMap::new();
        deps.insert(
            "a.dep@1".to_string(),
            DependencyAsset {
                path: Utf8PathBuf::new(),
                result_hash: "1111".to_string(),
            },
        );
        deps.insert(
            "a.other@1".to_string(),
            DependencyAsset {
                path: Utf8PathBuf::new(),
                result_hash: "2222".to_string(),
            },
        );

        let first = input_digest(&key, &source, &declared, &deps);
        let second = input_digest(&key, &source, &declared, &deps);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        // Digest must react to a dependency hash change.
        deps.get_mut("a.dep@1").unwrap().result_hash = "3333".to_string();
        assert_ne!(input_digest(&key, &source, &declared, &deps), first);
    }

    #[test]
    fn script_sources_are_recognized_by_suffix() {
        assert!(source_is_script(&PackageSource::Remote {
            url: "https://example/recipes/tool.lua".to_string(),
            sha256: "ab".repeat(32),
            subdir: None,
        }));
        assert!(!source_is_script(&PackageSource::Remote {
            url: "https://example/tool.tar.gz".to_string(),
            sha256: "ab".repeat(32),
            subdir: None,
        }));
        assert!(source_is_script(&PackageSource::Git {
            url: "https://example/repo.git".to_string(),
            git_ref: "main".to_string(),
            subdir: Some("recipes/tool.lua".to_string()),
        }));
        assert!(!source_is_script(&PackageSource::WeakRef));
    }
}
