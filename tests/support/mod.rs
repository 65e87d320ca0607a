#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use tandem::db::Database;
use tandem::decode::DecodeJobs;
use tandem::import::{IngestConfig, IngestLocks, IngestPipeline};
use tandem::store::AssetStore;
use tandem::test_support::MockDecoder;
use tempfile::TempDir;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Pipeline over a real sqlite database and cache root in a temp dir
pub struct IngestFixture {
    pub pipeline: IngestPipeline,
    pub store: AssetStore,
    pub decoder: Arc<MockDecoder>,
    pub locks: IngestLocks,
    pub jobs: DecodeJobs,
    pub media_dir: PathBuf,
    pub temp_dir: TempDir,
}

impl IngestFixture {
    pub async fn new(decoder: MockDecoder) -> Self {
        Self::with_budget(decoder, u64::MAX).await
    }

    pub async fn with_budget(decoder: MockDecoder, max_cache_bytes: u64) -> Self {
        tracing_init();

        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let database = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let store = AssetStore::new(database, temp_dir.path().join("files"))
            .await
            .unwrap();

        let media_dir = temp_dir.path().join("media");
        std::fs::create_dir_all(&media_dir).unwrap();

        let decoder = Arc::new(decoder);
        let locks = IngestLocks::new();
        let jobs = DecodeJobs::new();
        let pipeline = IngestPipeline::new(
            store.clone(),
            decoder.clone(),
            locks.clone(),
            jobs.clone(),
            IngestConfig {
                max_cache_bytes,
                ..Default::default()
            },
            tokio::runtime::Handle::current(),
        );

        IngestFixture {
            pipeline,
            store,
            decoder,
            locks,
            jobs,
            media_dir,
            temp_dir,
        }
    }

    /// Write a media file whose content (and so content id) is derived
    /// from `seed`
    pub fn write_media(&self, name: &str, seed: &str) -> PathBuf {
        let path = self.media_dir.join(name);
        std::fs::write(&path, format!("fake container: {}", seed).repeat(16)).unwrap();
        path
    }
}
