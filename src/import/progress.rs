use crate::fingerprint::ContentId;
use crate::import::types::IngestProgress;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::debug;

type SubscriptionId = u64;

/// Filter criteria for progress subscriptions
#[derive(Debug, Clone)]
enum SubscriptionFilter {
    All,
    Content { content_id: ContentId },
}

impl SubscriptionFilter {
    fn matches(&self, progress: &IngestProgress) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Content { content_id } => match progress {
                IngestProgress::Started { content_id: id, .. }
                | IngestProgress::TrackComplete { content_id: id, .. }
                | IngestProgress::TrackFailed { content_id: id, .. }
                | IngestProgress::Complete { content_id: id, .. } => id == content_id,
            },
        }
    }
}

struct Subscription {
    filter: SubscriptionFilter,
    tx: tokio_mpsc::UnboundedSender<IngestProgress>,
}

type Subscriptions = Arc<Mutex<HashMap<SubscriptionId, Subscription>>>;

/// Handle for subscribing to ingestion progress updates
#[derive(Clone)]
pub struct IngestProgressHandle {
    subscriptions: Subscriptions,
    next_id: Arc<AtomicU64>,
}

fn lock(subscriptions: &Subscriptions) -> MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
    subscriptions.lock().unwrap_or_else(|e| e.into_inner())
}

impl IngestProgressHandle {
    /// Create a new progress handle and spawn background task to process progress updates
    pub fn new(
        mut progress_rx: tokio_mpsc::UnboundedReceiver<IngestProgress>,
        runtime_handle: tokio::runtime::Handle,
    ) -> Self {
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions_clone = subscriptions.clone();

        runtime_handle.spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let mut subs = lock(&subscriptions_clone);
                // Receivers that were dropped fail to send and get removed
                subs.retain(|_, subscription| {
                    !subscription.filter.matches(&progress)
                        || subscription.tx.send(progress.clone()).is_ok()
                });
            }
            debug!("Ingest progress channel closed, exiting");
        });

        Self {
            subscriptions,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn subscribe(&self, filter: SubscriptionFilter) -> tokio_mpsc::UnboundedReceiver<IngestProgress> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscriptions).insert(id, Subscription { filter, tx });
        rx
    }

    /// Subscribe to every ingestion's progress
    pub fn subscribe_all(&self) -> tokio_mpsc::UnboundedReceiver<IngestProgress> {
        self.subscribe(SubscriptionFilter::All)
    }

    /// Subscribe to progress of one content id only
    pub fn subscribe_content(
        &self,
        content_id: ContentId,
    ) -> tokio_mpsc::UnboundedReceiver<IngestProgress> {
        self.subscribe(SubscriptionFilter::Content { content_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(c: char) -> ContentId {
        ContentId::from_hex(c.to_string().repeat(64)).unwrap()
    }

    #[tokio::test]
    async fn test_content_filter() {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let handle = IngestProgressHandle::new(rx, tokio::runtime::Handle::current());
        let mut only_a = handle.subscribe_content(id('a'));
        let mut all = handle.subscribe_all();

        tx.send(IngestProgress::Complete { content_id: id('b'), tracks: 1 })
            .unwrap();
        tx.send(IngestProgress::Complete { content_id: id('a'), tracks: 2 })
            .unwrap();

        assert_eq!(
            only_a.recv().await.unwrap(),
            IngestProgress::Complete { content_id: id('a'), tracks: 2 }
        );
        assert_eq!(
            all.recv().await.unwrap(),
            IngestProgress::Complete { content_id: id('b'), tracks: 1 }
        );
    }
}
