use crate::db::LruCursor;
use crate::fingerprint::ContentId;
use crate::import::IngestLocks;
use crate::store::{AssetStore, StoreError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default cache budget (10 GiB)
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Candidates fetched per least-recently-accessed batch
pub const EVICTION_BATCH_SIZE: u32 = 50;

/// Upper bound on directory entries visited by one size computation
pub const MAX_WALK_ENTRIES: usize = 1_000_000;

/// Errors that can occur during cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to size {}: {source}", path.display())]
    Size {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Directory walk exceeded {0} entries")]
    WalkLimit(usize),
    #[error("Size computation task failed: {0}")]
    Join(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one enforcement pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    pub initial_bytes: u64,
    pub final_bytes: u64,
    /// Evicted entries, oldest first
    pub evicted: Vec<ContentId>,
    /// Entries skipped because an ingestion held them
    pub skipped_in_progress: Vec<ContentId>,
    /// Entries whose eviction left rows or files behind
    pub partial_failures: Vec<ContentId>,
    /// True if every candidate was considered without reaching the budget
    pub exhausted: bool,
}

/// Enforces the total-size budget over the asset store with LRU eviction.
///
/// The governor is the only component that deletes cache entries.
#[derive(Clone)]
pub struct CacheGovernor {
    store: AssetStore,
    locks: IngestLocks,
}

impl CacheGovernor {
    pub fn new(store: AssetStore, locks: IngestLocks) -> Self {
        CacheGovernor { store, locks }
    }

    /// Current on-disk size of the store root
    pub async fn cache_size(&self) -> Result<u64, CacheError> {
        dir_size(self.store.root().to_path_buf(), MAX_WALK_ENTRIES).await
    }

    /// Evict least-recently-accessed entries until the store root is at or
    /// below `max_bytes` or no candidates are left.
    ///
    /// Size is recomputed after every single eviction. A size computation
    /// failure aborts the pass; the cache may stay over budget.
    pub async fn enforce_budget(&self, max_bytes: u64) -> Result<EvictionReport, CacheError> {
        let initial_bytes = self.cache_size().await?;
        let mut report = EvictionReport {
            initial_bytes,
            final_bytes: initial_bytes,
            ..Default::default()
        };

        if initial_bytes <= max_bytes {
            debug!(
                "CacheGovernor: {} bytes within budget of {} bytes",
                initial_bytes, max_bytes
            );
            return Ok(report);
        }

        info!(
            "CacheGovernor: {} bytes exceeds budget of {} bytes, evicting",
            initial_bytes, max_bytes
        );

        let mut cursor: Option<LruCursor> = None;
        loop {
            let batch = self
                .store
                .list_least_recently_accessed_after(cursor.as_ref(), EVICTION_BATCH_SIZE)
                .await?;
            if batch.is_empty() {
                report.exhausted = true;
                break;
            }

            for candidate in batch {
                cursor = Some(candidate.clone());
                let content_id = candidate.content_id;

                let Some(_guard) = self.locks.try_acquire(&content_id) else {
                    debug!("CacheGovernor: Skipping {} (ingestion in progress)", content_id);
                    report.skipped_in_progress.push(content_id);
                    continue;
                };

                match self.store.delete(&content_id).await {
                    Ok(()) => {
                        info!("CacheGovernor: Evicted {}", content_id);
                        report.evicted.push(content_id);
                    }
                    Err(e @ StoreError::PartialEviction { .. }) => {
                        warn!("CacheGovernor: {}", e);
                        report.partial_failures.push(content_id);
                    }
                    Err(e) => {
                        warn!("CacheGovernor: Failed to evict {}: {}", content_id, e);
                        report.partial_failures.push(content_id);
                    }
                }

                report.final_bytes = self.cache_size().await?;
                if report.final_bytes <= max_bytes {
                    info!(
                        "CacheGovernor: Back within budget at {} bytes after {} evictions",
                        report.final_bytes,
                        report.evicted.len()
                    );
                    return Ok(report);
                }
            }
        }

        warn!(
            "CacheGovernor: Candidates exhausted at {} bytes (budget {} bytes)",
            report.final_bytes, max_bytes
        );
        Ok(report)
    }
}

/// Total size of all regular files below `root`.
///
/// Fails on the first entry that cannot be read rather than returning a
/// partial sum. A missing root counts as empty.
pub async fn dir_size(root: PathBuf, max_entries: usize) -> Result<u64, CacheError> {
    tokio::task::spawn_blocking(move || dir_size_blocking(&root, max_entries))
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
}

fn dir_size_blocking(root: &Path, max_entries: usize) -> Result<u64, CacheError> {
    let size_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| CacheError::Size { path, source }
    };

    match std::fs::symlink_metadata(root) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(size_err(root)(e)),
        Ok(_) => {}
    }

    let mut total = 0u64;
    let mut visited = 0usize;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).map_err(size_err(&dir))? {
            let entry = entry.map_err(size_err(&dir))?;
            visited += 1;
            if visited > max_entries {
                return Err(CacheError::WalkLimit(max_entries));
            }

            let path = entry.path();
            let metadata = entry.metadata().map_err(size_err(&path))?;
            if metadata.is_dir() {
                pending.push(path);
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_dir_size_sums_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir_all(dir.path().join("x/y")).unwrap();
        std::fs::write(dir.path().join("x/y/b"), vec![0u8; 50]).unwrap();

        let size = dir_size(dir.path().to_path_buf(), MAX_WALK_ENTRIES)
            .await
            .unwrap();
        assert_eq!(size, 150);
    }

    #[tokio::test]
    async fn test_dir_size_missing_root_is_zero() {
        let dir = TempDir::new().unwrap();
        let size = dir_size(dir.path().join("nope"), MAX_WALK_ENTRIES)
            .await
            .unwrap();
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn test_dir_size_walk_limit() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(i.to_string()), b"x").unwrap();
        }
        let result = dir_size(dir.path().to_path_buf(), 3).await;
        assert!(matches!(result, Err(CacheError::WalkLimit(3))));
    }
}
