// # Ingest Locks
//
// Per-content-id mutual exclusion. At most one ingestion demuxes a given
// content id at a time; a second caller for the same id waits for the first
// to finish and then sees its result as a cache hit. The cache governor uses
// `try_acquire` so it never evicts an entry that is being ingested.

use crate::fingerprint::ContentId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type LockTable = HashMap<ContentId, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct IngestLocks {
    table: Arc<Mutex<LockTable>>,
}

/// Held while an entry is being ingested or evicted
pub struct IngestGuard {
    content_id: ContentId,
    table: Arc<Mutex<LockTable>>,
    // Dropped before the table cleanup in Drop runs
    guard: Option<OwnedMutexGuard<()>>,
}

impl IngestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, content_id: &ContentId) -> Arc<AsyncMutex<()>> {
        self.lock_table()
            .entry(content_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until no other ingestion holds `content_id`
    pub async fn acquire(&self, content_id: &ContentId) -> IngestGuard {
        let lock = self.entry(content_id);
        let guard = lock.lock_owned().await;
        trace!("IngestLocks: Acquired {}", content_id);
        IngestGuard {
            content_id: content_id.clone(),
            table: self.table.clone(),
            guard: Some(guard),
        }
    }

    /// Take the lock only if it is free right now
    pub fn try_acquire(&self, content_id: &ContentId) -> Option<IngestGuard> {
        let lock = self.entry(content_id);
        match lock.try_lock_owned() {
            Ok(guard) => Some(IngestGuard {
                content_id: content_id.clone(),
                table: self.table.clone(),
                guard: Some(guard),
            }),
            Err(_) => None,
        }
    }

    pub fn is_held(&self, content_id: &ContentId) -> bool {
        self.lock_table()
            .get(content_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of content ids with a live lock entry
    pub fn len(&self) -> usize {
        self.lock_table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IngestGuard {
    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }
}

impl Drop for IngestGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        // The table holds one reference; anyone else waiting holds another
        let unused = table
            .get(&self.content_id)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if unused {
            table.remove(&self.content_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(c: char) -> ContentId {
        ContentId::from_hex(c.to_string().repeat(64)).unwrap()
    }

    #[tokio::test]
    async fn test_try_acquire_fails_while_held() {
        let locks = IngestLocks::new();
        let guard = locks.acquire(&id('a')).await;
        assert!(locks.is_held(&id('a')));
        assert!(locks.try_acquire(&id('a')).is_none());
        assert!(locks.try_acquire(&id('b')).is_some());

        drop(guard);
        assert!(!locks.is_held(&id('a')));
        assert!(locks.try_acquire(&id('a')).is_some());
    }

    #[tokio::test]
    async fn test_second_caller_waits() {
        let locks = IngestLocks::new();
        let guard = locks.acquire(&id('a')).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&id('a')).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
