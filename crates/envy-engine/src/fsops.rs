//! Small filesystem helpers shared by phase actions

use camino::Utf8Path;
use std::fs;
use std::io;

/// Recursively copy `src` into `dest` (which is created if absent).
pub fn copy_tree(src: &Utf8Path, dest: &Utf8Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dest.as_std_path().join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
