//! Content verification digests
//!
//! Two digest families back the engine's content addressing: SHA-256 for
//! declared-source verification and the outward cache entry identifier, and
//! BLAKE3 for the internal fingerprint of an installed tree. Both are
//! reproducible bit-for-bit across platforms; the tree digest walks entries
//! in sorted order and hashes each file's cache-relative path alongside its
//! content so renames change the digest.

use camino::Utf8Path;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use walkdir::WalkDir;

/// Errors from digest computation and verification.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("declared digest '{digest}' is not 64 lowercase hex characters")]
    InvalidDigest { digest: String },

    #[error("hash mismatch: declared {expected}, computed {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("failed to walk {path}: {source}")]
    Walk {
        path: String,
        #[source]
        source: walkdir::Error,
    },
}

/// A 32-byte digest value.
pub type Digest32 = [u8; 32];

/// Validate that a declared SHA-256 digest is 64 lowercase hex characters.
pub fn validate_sha256_hex(digest: &str) -> Result<(), HashError> {
    let ok = digest.len() == 64
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(HashError::InvalidDigest {
            digest: digest.to_string(),
        })
    }
}

/// SHA-256 of a file's content.
pub fn sha256_file(path: &Utf8Path) -> Result<Digest32, HashError> {
    let mut file = File::open(path).map_err(|source| HashError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|source| HashError::Io {
            path: path.to_string(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// SHA-256 of an in-memory buffer.
#[must_use]
pub fn sha256_bytes(data: &[u8]) -> Digest32 {
    Sha256::digest(data).into()
}

/// Check a computed digest against its declared lowercase-hex form.
pub fn sha256_verify(expected_hex: &str, actual: &Digest32) -> Result<(), HashError> {
    validate_sha256_hex(expected_hex)?;
    let actual_hex = hex::encode(actual);
    if actual_hex == expected_hex {
        Ok(())
    } else {
        Err(HashError::Mismatch {
            expected: expected_hex.to_string(),
            actual: actual_hex,
        })
    }
}

/// BLAKE3 of an in-memory buffer.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> Digest32 {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 fingerprint of a directory tree.
///
/// Files are visited in sorted path order; each contributes its
/// root-relative path (forward slashes) and content. Directories contribute
/// their path only, so empty directories still affect the digest.
pub fn blake3_tree(root: &Utf8Path) -> Result<Digest32, HashError> {
    let mut hasher = blake3::Hasher::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| HashError::Walk {
            path: root.to_string(),
            source,
        })?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel = rel.to_string_lossy().replace('\\', "/");
        hasher.update(rel.as_bytes());
        hasher.update(&[0]);
        if entry.file_type().is_file() {
            let mut file = File::open(entry.path()).map_err(|source| HashError::Io {
                path: entry.path().display().to_string(),
                source,
            })?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf).map_err(|source| HashError::Io {
                    path: entry.path().display().to_string(),
                    source,
                })?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        hasher.update(&[0]);
    }
    Ok(*hasher.finalize().as_bytes())
}
