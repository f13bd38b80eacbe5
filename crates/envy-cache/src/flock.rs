//! Cross-process entry locks
//!
//! One lock file per logical cache entry, held exclusively for the whole
//! check-through-deploy window. The cross-process half is a whole-file
//! exclusive lock (`fcntl(F_SETLKW)` on POSIX, `LockFileEx` on Windows).
//! POSIX advisory locks are per-process, so two threads of the same process
//! asking for the same path must additionally serialize through an
//! in-process claim keyed by the canonicalized lock path.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};

use crate::CacheError;

/// In-process claim registry over normalized lock paths. POSIX advisory
/// locks are per-process, so threads of one process contending for the same
/// entry serialize here before touching the file lock.
struct PathClaims {
    busy: Mutex<HashSet<String>>,
    released: Condvar,
}

static PATH_CLAIMS: Lazy<PathClaims> = Lazy::new(|| PathClaims {
    busy: Mutex::new(HashSet::new()),
    released: Condvar::new(),
});

/// Held claim on one normalized lock path; released on drop.
#[derive(Debug)]
struct PathClaim {
    key: String,
}

impl PathClaim {
    fn acquire(key: String) -> Self {
        let mut busy = PATH_CLAIMS.busy.lock();
        while busy.contains(&key) {
            PATH_CLAIMS.released.wait(&mut busy);
        }
        busy.insert(key.clone());
        Self { key }
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        PATH_CLAIMS.busy.lock().remove(&self.key);
        PATH_CLAIMS.released.notify_all();
    }
}

/// Diagnostic payload written into the lock file while it is held.
///
/// The flock is the mutual-exclusion mechanism; this content exists so a
/// human inspecting a busy cache can see who holds an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub entry: String,
}

/// Normalize a lock path so `./x` and `/abs/x` share one in-process mutex.
fn mutex_key(path: &Utf8Path) -> String {
    let parent = path.parent().unwrap_or(Utf8Path::new("."));
    let file_name = path.file_name().unwrap_or_default();
    match dunce::canonicalize(parent.as_std_path()) {
        Ok(parent) => parent.join(file_name).to_string_lossy().into_owned(),
        Err(_) => path.to_string(),
    }
}

/// An exclusively held entry lock.
///
/// Dropping the lock releases the flock and removes the lock file.
#[derive(Debug)]
pub struct EntryLock {
    path: Utf8PathBuf,
    file: File,
    _in_process: PathClaim,
}

impl EntryLock {
    /// Block until the exclusive lock on `path` is held.
    ///
    /// Waiters on the same path are granted the lock in FIFO order per path;
    /// same-process waiters queue on the in-process mutex before touching
    /// the file lock at all.
    pub fn acquire(path: &Utf8Path, entry: &str) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                path: parent.to_path_buf(),
                op: "create locks directory",
                source,
            })?;
        }

        let in_process = PathClaim::acquire(mutex_key(path));

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|source| CacheError::Io {
                path: path.to_path_buf(),
                op: "open lock file",
                source,
            })?;

        lock_exclusive(&file).map_err(|source| CacheError::LockFailed {
            path: path.to_path_buf(),
            reason: source.to_string(),
        })?;

        let lock = Self {
            path: path.to_path_buf(),
            file,
            _in_process: in_process,
        };
        lock.write_diagnostics(entry);
        Ok(lock)
    }

    fn write_diagnostics(&self, entry: &str) {
        let info = LockInfo {
            pid: std::process::id(),
            created_at: Utc::now(),
            entry: entry.to_string(),
        };
        // Best effort only; the flock is already held.
        let result = serde_json::to_string_pretty(&info)
            .map_err(io::Error::other)
            .and_then(|json| {
                let mut file = &self.file;
                file.set_len(0)?;
                file.write_all(json.as_bytes())?;
                file.flush()
            });
        if let Err(err) = result {
            tracing::debug!(path = %self.path, %err, "failed to write lock diagnostics");
        }
    }

    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        if let Err(err) = unlock(&self.file) {
            tracing::debug!(path = %self.path, %err, "failed to release entry lock");
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path, %err, "failed to remove lock file");
            }
        }
    }
}

/// Read the diagnostics of a held lock, if any.
pub fn read_lock_info(path: &Utf8Path) -> Option<LockInfo> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = 0;
    lock.l_len = 0; // whole file

    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &lock) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_UNLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = 0;
    lock.l_len = 0;

    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LockFileEx};
    use windows::Win32::System::IO::OVERLAPPED;

    let mut overlapped = OVERLAPPED::default();
    unsafe {
        LockFileEx(
            HANDLE(file.as_raw_handle()),
            LOCKFILE_EXCLUSIVE_LOCK,
            0,
            u32::MAX,
            u32::MAX,
            &mut overlapped,
        )
    }
    .map_err(io::Error::other)
}

#[cfg(windows)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::UnlockFileEx;
    use windows::Win32::System::IO::OVERLAPPED;

    let mut overlapped = OVERLAPPED::default();
    unsafe {
        UnlockFileEx(
            HANDLE(file.as_raw_handle()),
            0,
            u32::MAX,
            u32::MAX,
            &mut overlapped,
        )
    }
    .map_err(io::Error::other)
}
