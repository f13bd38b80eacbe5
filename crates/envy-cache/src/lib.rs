//! Shared on-disk cache for envy assets and recipes
//!
//! The cache keeps two namespaced areas under one root (`assets/` and
//! `recipes/`, plus `locks/`). Its single primitive is [`Cache::ensure_entry`]:
//! decide whether a logical entry is already complete, and if not, take the
//! entry's exclusive lock, prepare a staging area, and hand back a scoped
//! guard. The guard commits the staged install atomically on
//! [`EntryGuard::mark_complete`] and rolls back otherwise, so a crash at any
//! point before commit leaves no completeness marker and the next run starts
//! clean.
//!
//! # Entry layout
//!
//! ```text
//! assets/<identity>.<platform>-<arch>-sha256-<hash_prefix>/
//! ├── .envy-complete      completeness marker (existence is the signal)
//! ├── asset/              committed payload
//! ├── .install/           staged payload, renamed to asset/ on commit
//! └── .work/              transient work area
//!     ├── fetch/
//!     └── stage/
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io;

mod flock;

pub use flock::{EntryLock, LockInfo, read_lock_info};

/// Marker file whose existence makes an entry complete.
pub const COMPLETE_MARKER: &str = ".envy-complete";

const INSTALL_DIR: &str = ".install";
const WORK_DIR: &str = ".work";
const ASSET_DIR: &str = "asset";

/// Errors from cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache {op} failed for {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to lock {path}: {reason}")]
    LockFailed { path: Utf8PathBuf, reason: String },

    #[error("no cache root: ENVY_CACHE_ROOT is unset and no platform cache directory exists")]
    NoCacheRoot,

    #[error("cache root is not valid UTF-8: {path}")]
    NonUtf8Root { path: std::path::PathBuf },
}

fn io_err<'a>(path: &'a Utf8Path, op: &'static str) -> impl FnOnce(io::Error) -> CacheError + 'a {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        op,
        source,
    }
}

/// Result of [`Cache::ensure_entry`].
#[derive(Debug)]
pub enum Entry {
    /// The entry is already committed; no lock was taken.
    Complete { entry_path: Utf8PathBuf },
    /// The entry is not complete; the caller holds its exclusive lock.
    Pending(EntryGuard),
}

impl Entry {
    /// The committed payload directory, for complete entries.
    #[must_use]
    pub fn asset_path(&self) -> Utf8PathBuf {
        match self {
            Self::Complete { entry_path } => entry_path.join(ASSET_DIR),
            Self::Pending(guard) => guard.asset_path(),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// Scoped owner of an in-flight cache entry.
///
/// Holds the entry's exclusive lock from creation until drop. The drop
/// branch is decided by [`mark_complete`](Self::mark_complete):
///
/// - **committed**: stale `stage/` and any pre-existing `asset/` are
///   removed, `.install/` is atomically renamed to `asset/`, the work area
///   is deleted, and the completeness marker is created;
/// - **rolled back**: `.install/` and `stage/` are removed; the rest of the
///   work area is left for diagnostics.
///
/// Either way the lock is released and the lock file removed. The rollback
/// branch never panics.
#[derive(Debug)]
pub struct EntryGuard {
    entry_path: Utf8PathBuf,
    complete: bool,
    lock: Option<EntryLock>,
}

impl EntryGuard {
    /// Flag the staged install for commit when the guard drops.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    #[must_use]
    pub fn entry_path(&self) -> &Utf8Path {
        &self.entry_path
    }

    /// Staging area for the final payload; renamed to `asset/` on commit.
    #[must_use]
    pub fn install_path(&self) -> Utf8PathBuf {
        self.entry_path.join(INSTALL_DIR)
    }

    #[must_use]
    pub fn work_path(&self) -> Utf8PathBuf {
        self.entry_path.join(WORK_DIR)
    }

    #[must_use]
    pub fn fetch_path(&self) -> Utf8PathBuf {
        self.entry_path.join(WORK_DIR).join("fetch")
    }

    #[must_use]
    pub fn stage_path(&self) -> Utf8PathBuf {
        self.entry_path.join(WORK_DIR).join("stage")
    }

    /// Where the payload will live once committed.
    #[must_use]
    pub fn asset_path(&self) -> Utf8PathBuf {
        self.entry_path.join(ASSET_DIR)
    }

    fn commit(&self) -> Result<(), CacheError> {
        let stage = self.stage_path();
        if stage.exists() {
            fs::remove_dir_all(&stage).map_err(io_err(&stage, "remove stage"))?;
        }

        let asset = self.asset_path();
        if asset.exists() {
            fs::remove_dir_all(&asset).map_err(io_err(&asset, "remove stale asset"))?;
        }

        let install = self.install_path();
        fs::rename(&install, &asset).map_err(io_err(&install, "commit install"))?;

        let work = self.work_path();
        if work.exists() {
            fs::remove_dir_all(&work).map_err(io_err(&work, "remove work area"))?;
        }

        let marker = self.entry_path.join(COMPLETE_MARKER);
        fs::write(&marker, b"").map_err(io_err(&marker, "write completeness marker"))?;
        Ok(())
    }

    fn rollback(&self) {
        for dir in [self.install_path(), self.stage_path()] {
            if let Err(err) = fs::remove_dir_all(&dir) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %dir, %err, "cache rollback could not remove directory");
                }
            }
        }
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if self.complete {
            if let Err(err) = self.commit() {
                tracing::error!(entry = %self.entry_path, %err, "cache entry commit failed");
                self.rollback();
            }
        } else {
            self.rollback();
        }
        // Release the flock and remove the lock file.
        self.lock.take();
    }
}

/// Handle to a cache root.
#[derive(Debug, Clone)]
pub struct Cache {
    root: Utf8PathBuf,
}

impl Cache {
    /// Open (and create, if needed) a cache under an explicit root.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        for dir in [
            root.clone(),
            root.join("assets"),
            root.join("recipes"),
            root.join("locks"),
        ] {
            fs::create_dir_all(&dir).map_err(io_err(&dir, "create cache directory"))?;
        }
        Ok(Self { root })
    }

    /// Open the cache at the environment-selected root:
    /// `ENVY_CACHE_ROOT` if set, otherwise the platform cache directory
    /// (`~/Library/Caches` on macOS, `$XDG_CACHE_HOME` or `~/.cache` on
    /// other POSIX, `%LOCALAPPDATA%` on Windows) plus `envy`.
    pub fn from_env() -> Result<Self, CacheError> {
        if let Ok(root) = std::env::var("ENVY_CACHE_ROOT") {
            return Self::open(Utf8PathBuf::from(root));
        }
        let base = dirs::cache_dir().ok_or(CacheError::NoCacheRoot)?;
        let base =
            Utf8PathBuf::from_path_buf(base).map_err(|path| CacheError::NonUtf8Root { path })?;
        Self::open(base.join("envy"))
    }

    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    #[must_use]
    pub fn assets_dir(&self) -> Utf8PathBuf {
        self.root.join("assets")
    }

    #[must_use]
    pub fn recipes_dir(&self) -> Utf8PathBuf {
        self.root.join("recipes")
    }

    #[must_use]
    pub fn locks_dir(&self) -> Utf8PathBuf {
        self.root.join("locks")
    }

    /// Ensure the asset entry for one built package configuration.
    pub fn ensure_asset(
        &self,
        identity: &str,
        platform: &str,
        arch: &str,
        hash_prefix: &str,
    ) -> Result<Entry, CacheError> {
        let entry_name = format!("{identity}.{platform}-{arch}-sha256-{hash_prefix}");
        let entry_dir = self.assets_dir().join(&entry_name);
        let lock_path = self.locks_dir().join(format!("assets.{entry_name}.lock"));
        self.ensure_entry(&entry_dir, &lock_path)
    }

    /// Ensure the recipe entry holding one package's fetched script source.
    pub fn ensure_recipe(&self, identity: &str) -> Result<Entry, CacheError> {
        let entry_dir = self.recipes_dir().join(format!("{identity}.lua"));
        let lock_path = self.locks_dir().join(format!("recipe.{identity}.lock"));
        self.ensure_entry(&entry_dir, &lock_path)
    }

    /// The single cache primitive.
    ///
    /// Completeness is re-checked after the lock is granted: a waiter whose
    /// predecessor finished the entry observes the marker, releases the lock
    /// immediately, and gets the fast path. Scratch directories are only
    /// prepared under the lock, so at most one writer ever touches
    /// `.install/` (the §8 mutual-exclusion invariant).
    pub fn ensure_entry(
        &self,
        entry_dir: &Utf8Path,
        lock_path: &Utf8Path,
    ) -> Result<Entry, CacheError> {
        // Fast path: a committed entry is usable without any locking.
        if entry_dir.join(COMPLETE_MARKER).exists() {
            tracing::debug!(entry = %entry_dir, "cache hit");
            return Ok(Entry::Complete {
                entry_path: entry_dir.to_path_buf(),
            });
        }

        fs::create_dir_all(entry_dir).map_err(io_err(entry_dir, "create entry directory"))?;

        let entry_name = entry_dir.file_name().unwrap_or_default();
        let lock = EntryLock::acquire(lock_path, entry_name)?;

        if entry_dir.join(COMPLETE_MARKER).exists() {
            // Another process finished while we waited on the lock.
            tracing::debug!(entry = %entry_dir, "cache hit after lock wait");
            drop(lock);
            return Ok(Entry::Complete {
                entry_path: entry_dir.to_path_buf(),
            });
        }

        let guard = EntryGuard {
            entry_path: entry_dir.to_path_buf(),
            complete: false,
            lock: Some(lock),
        };
        prepare_scratch(&guard)?;
        tracing::debug!(entry = %entry_dir, "cache entry locked for install");
        Ok(Entry::Pending(guard))
    }
}

/// Empty `.install/` and `.work/stage/`, keep `.work/fetch/` from prior
/// attempts (crash recovery may reuse downloaded sources).
fn prepare_scratch(guard: &EntryGuard) -> Result<(), CacheError> {
    let install = guard.install_path();
    if install.exists() {
        fs::remove_dir_all(&install).map_err(io_err(&install, "clear install area"))?;
    }
    fs::create_dir_all(&install).map_err(io_err(&install, "create install area"))?;

    let fetch = guard.fetch_path();
    fs::create_dir_all(&fetch).map_err(io_err(&fetch, "create fetch area"))?;

    let stage = guard.stage_path();
    if stage.exists() {
        fs::remove_dir_all(&stage).map_err(io_err(&stage, "clear stage area"))?;
    }
    fs::create_dir_all(&stage).map_err(io_err(&stage, "create stage area"))?;
    Ok(())
}
