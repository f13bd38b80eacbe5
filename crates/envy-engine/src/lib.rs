//! Package execution engine
//!
//! The engine takes a set of root package declarations, builds the package
//! graph as dependencies are discovered, drives every package through the
//! phase pipeline over a shared content-addressed cache, and returns a
//! result per canonical key once the graph is quiescent. Failures never
//! cross package boundaries except through the dependency edges; the engine
//! drains all independent work before returning.

use camino::{Utf8Path, Utf8PathBuf};
use envy_cache::Cache;
use envy_cfg::{ParseContext, parse_table};
use envy_phases::Phase;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub mod collab;
pub mod error;
pub mod logging;
pub mod report;
pub mod retry;

mod fsops;
mod graph;
mod record;

pub use collab::{
    BuildLog, DependencyAsset, PackageScript, ScriptContext, ScriptHost, SourceFetcher, TracingLog,
};
pub use error::EnvyError;
pub use record::PackageRecord;
pub use retry::TransientNetworkError;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Platform tag used in asset entry names (defaults to the host OS).
    pub platform: String,
    /// Architecture tag used in asset entry names.
    pub arch: String,
    /// Attempts per network fetch before a transient failure becomes fatal.
    pub fetch_attempts: u32,
    /// Base delay for exponential fetch backoff.
    pub backoff_base: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            fetch_attempts: 3,
            backoff_base: Duration::from_millis(250),
        }
    }
}

/// Outcome of one package, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOutcome {
    /// BLAKE3 hex of the installed tree; empty for failed or content-free
    /// packages.
    pub result_hash: String,
    /// Installed asset directory, when one was produced.
    pub asset_path: Option<Utf8PathBuf>,
}

/// Result of one engine run: every scheduled package by canonical key, plus
/// the failures with their recorded errors.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub results: BTreeMap<String, PackageOutcome>,
    pub failures: BTreeMap<String, String>,
}

impl RunReport {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    #[must_use]
    pub fn outcome(&self, canonical_key: &str) -> Option<&PackageOutcome> {
        self.results.get(canonical_key)
    }
}

/// The package execution engine.
pub struct Engine {
    cache: Cache,
    host: Arc<dyn ScriptHost>,
    fetcher: Arc<dyn SourceFetcher>,
    log: Arc<dyn BuildLog>,
    options: EngineOptions,
}

impl Engine {
    #[must_use]
    pub fn new(cache: Cache, host: Arc<dyn ScriptHost>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            cache,
            host,
            fetcher,
            log: Arc::new(TracingLog),
            options: EngineOptions::default(),
        }
    }

    #[must_use]
    pub fn with_log(mut self, log: Arc<dyn BuildLog>) -> Self {
        self.log = log;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Execute `roots` (scripted package tables declared in `manifest`) and
    /// their transitive dependencies to completion.
    ///
    /// Root tables that fail validation abort the run with an error; once
    /// scheduling starts, per-package failures are collected in the report
    /// instead of propagating.
    pub fn run(&self, roots: &[Value], manifest: &Utf8Path) -> Result<RunReport, EnvyError> {
        let graph = Arc::new(graph::Graph::new(
            self.cache.clone(),
            Arc::clone(&self.host),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.log),
            self.options.clone(),
        ));

        let mut triggered = HashSet::new();
        for table in roots {
            let parse_ctx = ParseContext {
                declaring_file: manifest.to_path_buf(),
                parent: None,
                allow_weak_without_source: false,
            };
            let cfg_id = parse_table(table, &parse_ctx, &graph.pool)?;
            let cfg = graph
                .pool
                .get(cfg_id)
                .ok_or_else(|| EnvyError::InvalidCfg("cfg pool lookup failed".to_string()))?;
            let key = cfg.canonical_key()?;

            if !triggered.insert(key.to_string()) {
                continue;
            }
            tracing::info!(package = %key, "triggering root package");
            let ancestors = Arc::new(vec![cfg.identity.clone()]);
            graph.spawn_package(cfg_id, cfg, ancestors, Phase::Completion)?;
        }

        graph.wait_quiescence();

        let mut report = RunReport::default();
        for entry in graph.records.iter() {
            let record = entry.value();
            let key = entry.key().clone();
            report.results.insert(
                key.clone(),
                PackageOutcome {
                    result_hash: record.result_hash(),
                    asset_path: record.asset_path(),
                },
            );
            if let Some(error) = record.error() {
                report.failures.insert(key, error.to_string());
            }
        }

        tracing::info!(
            packages = report.results.len(),
            failures = report.failures.len(),
            "engine run finished"
        );
        Ok(report)
    }
}
