use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Number of leading bytes that contribute to a content id (100 MiB).
///
/// Files that only differ after this boundary share a content id. This is
/// accepted: hashing the whole of a multi-gigabyte video on every drop is not.
pub const FINGERPRINT_PREFIX_BYTES: u64 = 100 * 1024 * 1024;

const READ_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("IO error while fingerprinting {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Stable identifier of a media file, derived from a SHA-256 over its prefix.
///
/// Always 64 lowercase hex characters, which also makes it safe to use as a
/// directory name under the cache root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(String);

impl ContentId {
    /// Wrap an already computed hex digest (e.g. read back from the database).
    pub fn from_hex(hex_digest: impl Into<String>) -> Option<Self> {
        let value = hex_digest.into();
        let valid = value.len() == 64
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then_some(ContentId(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compute the content id of the file at `path`.
pub async fn fingerprint(path: &Path) -> Result<ContentId, FingerprintError> {
    fingerprint_with_limit(path, FINGERPRINT_PREFIX_BYTES).await
}

/// Compute a content id over at most `limit` leading bytes of the file.
pub async fn fingerprint_with_limit(
    path: &Path,
    limit: u64,
) -> Result<ContentId, FingerprintError> {
    let io_err = |source| FingerprintError::Io {
        path: path.display().to_string(),
        source,
    };

    let file = File::open(path).await.map_err(io_err)?;
    let mut reader = file.take(limit);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_BYTES];
    let mut total = 0u64;

    loop {
        let read = reader.read(&mut buffer).await.map_err(io_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }

    let content_id = ContentId(hex::encode(hasher.finalize()));
    debug!(
        "Fingerprinted {} ({} bytes hashed) -> {}",
        path.display(),
        total,
        content_id
    );
    Ok(content_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_identical_files_share_id() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.mp4", b"same bytes").await;
        let b = write(&dir, "b.mp4", b"same bytes").await;

        assert_eq!(fingerprint(&a).await.unwrap(), fingerprint(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_different_prefixes_differ() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.mp4", b"first file").await;
        let b = write(&dir, "b.mp4", b"other file").await;

        assert_ne!(fingerprint(&a).await.unwrap(), fingerprint(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_tail_after_prefix_is_ignored() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.mp4", b"0123456789-tail-one").await;
        let b = write(&dir, "b.mp4", b"0123456789-different-tail").await;

        let id_a = fingerprint_with_limit(&a, 10).await.unwrap();
        let id_b = fingerprint_with_limit(&b, 10).await.unwrap();
        assert_eq!(id_a, id_b);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = fingerprint(&dir.path().join("missing.mp4")).await;
        assert!(matches!(result, Err(FingerprintError::Io { .. })));
    }

    #[test]
    fn test_from_hex_validates() {
        assert!(ContentId::from_hex("a".repeat(64)).is_some());
        assert!(ContentId::from_hex("A".repeat(64)).is_none());
        assert!(ContentId::from_hex("../etc").is_none());
    }
}
