use crate::config::{Config, ConfigError};
use crate::db::Database;
use crate::decode::{DecodeJobs, FfmpegDecoder, MediaDecoder};
use crate::import::{IngestConfig, IngestError, IngestLocks, IngestOutcome, IngestPipeline};
use crate::playback::{
    AudioDeviceBackend, PlaybackConfig, PlaybackError, PlaybackHandle, PlaybackService,
    PlaybackStatus, TimelineBackend,
};
use crate::preview::{PreviewOptions, PreviewStream, ScrubPreviewGenerator};
use crate::store::{AssetStore, StoreError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),
    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),
}

/// Everything the application needs, wired once at startup
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub store: AssetStore,
    pub pipeline: IngestPipeline,
    pub playback_handle: PlaybackHandle,
    pub previews: ScrubPreviewGenerator,
    jobs: DecodeJobs,
}

impl AppContext {
    /// Wire the production stack: ffmpeg subprocesses and the default audio
    /// output device
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let decoder = Arc::new(FfmpegDecoder::new(&config.ffmpeg_path, &config.ffprobe_path));
        let backend = Arc::new(AudioDeviceBackend::new());
        Self::with_backends(config, decoder, backend, PlaybackConfig::default()).await
    }

    pub async fn with_backends(
        config: Config,
        decoder: Arc<dyn MediaDecoder>,
        backend: Arc<dyn TimelineBackend>,
        playback_config: PlaybackConfig,
    ) -> Result<Self, AppError> {
        if let Some(parent) = config.database_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let database = Database::new(&config.database_path.to_string_lossy()).await?;
        let store = AssetStore::new(database, &config.cache_dir).await?;

        let runtime_handle = tokio::runtime::Handle::current();
        let jobs = DecodeJobs::new();
        let pipeline = IngestPipeline::new(
            store.clone(),
            decoder.clone(),
            IngestLocks::new(),
            jobs.clone(),
            IngestConfig {
                max_cache_bytes: config.max_cache_bytes,
                ..Default::default()
            },
            runtime_handle.clone(),
        );
        let playback_handle =
            PlaybackService::start(store.clone(), backend, playback_config, runtime_handle);
        let previews = ScrubPreviewGenerator::new(decoder, jobs.clone());

        Ok(AppContext {
            config,
            store,
            pipeline,
            playback_handle,
            previews,
            jobs,
        })
    }

    /// Ingest `path` and load it into the playback controller.
    ///
    /// Decode work of any ingestion still running is cancelled first.
    pub async fn open(&self, path: &Path) -> Result<IngestOutcome, AppError> {
        let cancelled = self.jobs.release_ingestions();
        if cancelled > 0 {
            info!("AppContext: Cancelled {} outstanding decode jobs", cancelled);
        }

        let outcome = self.pipeline.ingest(path).await?;
        self.playback_handle.load(outcome.handle().clone()).await?;
        Ok(outcome)
    }

    /// Cancel outstanding ingestion and end the playback session
    pub async fn stop(&self) -> Result<PlaybackStatus, AppError> {
        self.jobs.release_ingestions();
        Ok(self.playback_handle.stop().await?)
    }

    pub fn preview(&self, path: &Path, options: PreviewOptions) -> PreviewStream {
        self.previews.generate(path, options)
    }
}
