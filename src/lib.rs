//! envy - a content-addressed, freeform package manager engine
//!
//! Packages are declared in scripted manifests; envy fetches, stages,
//! builds, installs, and deploys them into a shared on-disk cache, with
//! concurrent builds collaborating safely over a common directory.
//!
//! This crate is the facade over the engine workspace:
//!
//! - [`key`]: canonical `ns.name@rev{opts}` package keys
//! - [`phases`]: the ordered phase pipeline
//! - [`cfg`]: scripted package-table parsing and the cfg pool
//! - [`cache`]: the content-addressed cache with per-entry locking
//! - [`hash`]: SHA-256 / BLAKE3 verification digests
//! - [`engine`]: the package graph, scheduler, and `run` entry point

pub use envy_cache as cache;
pub use envy_cfg as cfg;
pub use envy_engine as engine;
pub use envy_hash as hash;
pub use envy_key as key;
pub use envy_phases as phases;

// The types most hosts need, at the crate root.
pub use envy_cache::{Cache, CacheError, Entry, EntryGuard};
pub use envy_cfg::{CfgError, CfgId, CfgPool, PackageCfg, PackageSource, ParseContext};
pub use envy_engine::{
    BuildLog, DependencyAsset, Engine, EngineOptions, EnvyError, PackageOutcome, PackageScript,
    RunReport, ScriptContext, ScriptHost, SourceFetcher, TracingLog, TransientNetworkError,
};
pub use envy_key::{CanonicalKey, KeyError, canonicalize_options};
pub use envy_phases::Phase;
