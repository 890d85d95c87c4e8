//! Content hashing primitives shared by the context and graph hashers.
//!
//! All symbolic hashes in tplbuild are SHA-256 digests of canonically
//! serialized JSON payloads. Payloads are built from arrays rather than
//! maps so the serialized form is identical across hosts.

use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, TplError};

/// Hex digest of the SHA-256 hash of the JSON serialization of `value`.
pub fn json_hash<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();
    serde_json::to_writer(HashWriter(&mut hasher), value)
        .expect("JSON serialization of hash payload cannot fail");
    hex_digest(hasher)
}

/// Hex digest of the SHA-256 hash of raw bytes.
pub fn bytes_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_digest(hasher)
}

/// Hash a file's content in streaming fashion.
pub fn file_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| TplError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| TplError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_digest(hasher))
}

/// Incremental hasher used when folding many entry hashes into one digest.
pub struct RollingHash(Sha256);

impl RollingHash {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.0.update(data.as_ref());
    }

    pub fn finish(self) -> String {
        hex_digest(self.0)
    }
}

impl Default for RollingHash {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_digest(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

/// Adapter that lets `serde_json` write directly into a hasher.
struct HashWriter<'a>(&'a mut Sha256);

impl std::io::Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_hash_stable() {
        let a = json_hash(&("step", "abc", vec!["x", "y"]));
        let b = json_hash(&("step", "abc", vec!["x", "y"]));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_json_hash_sensitive() {
        let a = json_hash(&("step", "abc"));
        let b = json_hash(&("step", "abd"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(file_hash(&path).unwrap(), bytes_hash(b"hello world"));
    }
}
