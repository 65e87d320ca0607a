// # Ingest Pipeline - Orchestrator
//
// validate → fingerprint → lock → lookup → (miss) probe → demux every audio
// stream concurrently → record tracks → mark complete → enforce cache budget.
//
// A hit never touches the decoder. Every decode task of one run is owned by
// a `JobScope`, so a cancelled run leaves no subprocess behind.

use crate::cache::CacheGovernor;
use crate::db::DbMediaRecord;
use crate::decode::{DecodeError, DecodeJobs, JobOwner, JobScope, MediaDecoder};
use crate::fingerprint::{self, ContentId, FingerprintError};
use crate::import::locks::IngestLocks;
use crate::import::progress::IngestProgressHandle;
use crate::import::types::{IngestOutcome, IngestProgress, MediaHandle, TrackFailure, TrackHandle};
use crate::import::validation::{check_supported_format, validate_regular_file};
use crate::store::{AssetStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid file {}: {reason}", path.display())]
    InvalidFile { path: PathBuf, reason: String },
    #[error("Unsupported format {}: {extension:?}", path.display())]
    UnsupportedFormat {
        path: PathBuf,
        extension: Option<String>,
    },
    #[error("No streams found in {}", path.display())]
    NoVideoStream { path: PathBuf },
    #[error("Decode failure: {0}")]
    DecodeFailure(#[from] DecodeError),
    #[error("Decode task failed: {0}")]
    Task(String),
    #[error("Ingestion was cancelled")]
    Cancelled,
    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Tunables for the ingest pipeline
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Cache budget enforced after every miss
    pub max_cache_bytes: u64,
    /// Bytes of each file fed to the fingerprint
    pub fingerprint_prefix_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            max_cache_bytes: crate::cache::DEFAULT_MAX_CACHE_BYTES,
            fingerprint_prefix_bytes: fingerprint::FINGERPRINT_PREFIX_BYTES,
        }
    }
}

/// Turns a dropped file into a `MediaHandle`, demuxing at most once per
/// content id
#[derive(Clone)]
pub struct IngestPipeline {
    store: AssetStore,
    decoder: Arc<dyn MediaDecoder>,
    governor: CacheGovernor,
    locks: IngestLocks,
    jobs: DecodeJobs,
    config: IngestConfig,
    progress_tx: mpsc::UnboundedSender<IngestProgress>,
    progress_handle: IngestProgressHandle,
}

impl IngestPipeline {
    pub fn new(
        store: AssetStore,
        decoder: Arc<dyn MediaDecoder>,
        locks: IngestLocks,
        jobs: DecodeJobs,
        config: IngestConfig,
        runtime_handle: tokio::runtime::Handle,
    ) -> Self {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let progress_handle = IngestProgressHandle::new(progress_rx, runtime_handle);
        let governor = CacheGovernor::new(store.clone(), locks.clone());

        IngestPipeline {
            store,
            decoder,
            governor,
            locks,
            jobs,
            config,
            progress_tx,
            progress_handle,
        }
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn governor(&self) -> &CacheGovernor {
        &self.governor
    }

    pub fn jobs(&self) -> &DecodeJobs {
        &self.jobs
    }

    pub fn progress(&self) -> &IngestProgressHandle {
        &self.progress_handle
    }

    /// Ingest `path`, serving from the cache when possible.
    ///
    /// A concurrent call for the same content id waits for the first to
    /// finish and then returns a hit.
    pub async fn ingest(&self, path: &Path) -> Result<IngestOutcome, IngestError> {
        let scope = self.jobs.scope(JobOwner::new_ingest());
        self.ingest_in_scope(path, &scope).await
    }

    async fn ingest_in_scope(
        &self,
        path: &Path,
        scope: &JobScope,
    ) -> Result<IngestOutcome, IngestError> {
        validate_regular_file(path).await?;
        check_supported_format(path)?;

        let video = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| IngestError::InvalidFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let content_id =
            fingerprint::fingerprint_with_limit(&video, self.config.fingerprint_prefix_bytes)
                .await?;
        info!("IngestPipeline: {} fingerprinted as {}", video.display(), content_id);

        let _guard = self.locks.acquire(&content_id).await;

        let record = match self.store.lookup(&content_id).await? {
            Some(record) if record.complete && self.assets_present(&content_id).await? => {
                self.store.touch(&content_id).await?;
                info!("IngestPipeline: Cache hit for {}", content_id);
                let handle = self.build_handle(&record, video).await?;
                return Ok(IngestOutcome::Hit(handle));
            }
            Some(record) => {
                info!(
                    "IngestPipeline: {} is incomplete or missing assets, re-ingesting",
                    content_id
                );
                self.store.reset_tracks(&content_id).await?;
                record
            }
            None => {
                info!("IngestPipeline: Cache miss for {}", content_id);
                self.store.insert(&content_id).await?
            }
        };

        let failures = self.demux_all(&content_id, &video, scope).await?;

        self.store.mark_complete(&content_id).await?;
        self.store.touch(&content_id).await?;

        let _ = self.progress_tx.send(IngestProgress::Complete {
            content_id: content_id.clone(),
            tracks: self.store.tracks(&content_id).await?.len(),
        });

        // Eviction is housekeeping; it never fails the ingestion
        match self.governor.enforce_budget(self.config.max_cache_bytes).await {
            Ok(report) if !report.evicted.is_empty() => {
                info!("IngestPipeline: Evicted {} entries", report.evicted.len())
            }
            Ok(_) => {}
            Err(e) => warn!("IngestPipeline: Cache budget enforcement aborted: {}", e),
        }

        let record = self.store.lookup(&content_id).await?.unwrap_or(record);
        let handle = self.build_handle(&record, video).await?;

        if failures.is_empty() {
            Ok(IngestOutcome::Miss(handle))
        } else {
            Ok(IngestOutcome::PartialFailure { handle, failures })
        }
    }

    /// Probe and demux every audio stream, returning the streams that failed
    async fn demux_all(
        &self,
        content_id: &ContentId,
        video: &Path,
        scope: &JobScope,
    ) -> Result<Vec<TrackFailure>, IngestError> {
        let probe = {
            let decoder = self.decoder.clone();
            let video = video.to_path_buf();
            scope
                .spawn(async move { decoder.probe(&video).await })
                .await
                .map_err(join_error)??
        };

        if probe.streams.is_empty() {
            return Err(IngestError::NoVideoStream {
                path: video.to_path_buf(),
            });
        }

        self.store.set_duration(content_id, probe.duration).await?;
        self.store.ensure_entry_dir(content_id).await?;

        let audio_streams = probe.audio_stream_count();
        let _ = self.progress_tx.send(IngestProgress::Started {
            content_id: content_id.clone(),
            audio_streams,
        });
        debug!(
            "IngestPipeline: Demuxing {} audio streams of {}",
            audio_streams, content_id
        );

        let tasks: Vec<_> = (0..audio_streams)
            .map(|stream_index| {
                let decoder = self.decoder.clone();
                let video = video.to_path_buf();
                let output = self.store.asset_path(content_id, stream_index);
                scope.spawn(async move { decoder.demux_audio(&video, stream_index, &output).await })
            })
            .collect();

        // Join all, tolerating individual failures
        let results = futures::future::join_all(tasks).await;

        let mut failures = Vec::new();
        let mut cancelled = false;
        for (stream_index, result) in (0..audio_streams).zip(results) {
            let error = match result {
                Ok(Ok(())) => match self.store.insert_track(content_id, stream_index).await {
                    Ok(_) => {
                        let _ = self.progress_tx.send(IngestProgress::TrackComplete {
                            content_id: content_id.clone(),
                            stream_index,
                        });
                        continue;
                    }
                    Err(e @ StoreError::MissingAsset(_)) => e.to_string(),
                    Err(e) => return Err(e.into()),
                },
                Ok(Err(e)) => e.to_string(),
                Err(e) if e.is_cancelled() => {
                    cancelled = true;
                    "cancelled".to_string()
                }
                Err(e) => e.to_string(),
            };

            warn!(
                "IngestPipeline: Audio stream {} of {} failed: {}",
                stream_index, content_id, error
            );
            let partial = self.store.asset_path(content_id, stream_index);
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("IngestPipeline: Could not remove {}: {}", partial.display(), e);
                }
            }

            let _ = self.progress_tx.send(IngestProgress::TrackFailed {
                content_id: content_id.clone(),
                stream_index,
                error: error.clone(),
            });
            failures.push(TrackFailure { stream_index, error });
        }

        if cancelled {
            info!("IngestPipeline: Ingestion of {} was cancelled", content_id);
            return Err(IngestError::Cancelled);
        }
        Ok(failures)
    }

    async fn assets_present(&self, content_id: &ContentId) -> Result<bool, IngestError> {
        for track in self.store.tracks(content_id).await? {
            let asset = self.store.asset_path(content_id, track.stream_index);
            if !tokio::fs::try_exists(&asset).await.map_err(StoreError::from)? {
                debug!("IngestPipeline: Missing asset {}", asset.display());
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn build_handle(
        &self,
        record: &DbMediaRecord,
        video: PathBuf,
    ) -> Result<MediaHandle, IngestError> {
        let tracks = self
            .store
            .tracks(&record.content_id)
            .await?
            .iter()
            .map(|track| {
                TrackHandle::from_record(
                    track,
                    self.store.asset_path(&record.content_id, track.stream_index),
                )
            })
            .collect();

        Ok(MediaHandle {
            content_id: record.content_id.clone(),
            video,
            duration: record.duration,
            tracks,
            playback: record.playback(),
        })
    }
}

fn join_error(e: JoinError) -> IngestError {
    if e.is_cancelled() {
        IngestError::Cancelled
    } else {
        IngestError::Task(e.to_string())
    }
}
