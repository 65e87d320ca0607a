// # Scrub Preview Generator
//
// Lazily produces evenly spaced seek-bar thumbnails straight from the source
// file. Frames are captured in fixed-size chunks so only a few decoder
// processes run at once, and the whole sequence shares one deadline. The
// generator has no access to playback state.

use crate::decode::{DecodeError, DecodeJobs, FrameRequest, JobOwner, JobScope, MediaDecoder};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Captures in flight at once
pub const PREVIEW_CHUNK_SIZE: usize = 4;

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("Invalid preview options: {0}")]
    InvalidOptions(String),
    #[error("Media has no usable duration")]
    NoDuration,
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Preview generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Capture task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewOptions {
    pub tile_width: u32,
    pub tile_height: u32,
    /// JPEG quality in (0, 1]
    pub quality: f32,
    pub max_tiles: u32,
    /// Budget for the whole sequence, probe included
    pub timeout: Duration,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        PreviewOptions {
            tile_width: 160,
            tile_height: 90,
            quality: 0.75,
            max_tiles: 100,
            timeout: Duration::from_secs(60),
        }
    }
}

impl PreviewOptions {
    fn validate(&self) -> Result<(), PreviewError> {
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(PreviewError::InvalidOptions(format!(
                "tile size {}x{}",
                self.tile_width, self.tile_height
            )));
        }
        if !(self.quality > 0.0 && self.quality <= 1.0) {
            return Err(PreviewError::InvalidOptions(format!(
                "quality {}",
                self.quality
            )));
        }
        if self.max_tiles == 0 {
            return Err(PreviewError::InvalidOptions("max_tiles 0".to_string()));
        }
        Ok(())
    }
}

/// One encoded JPEG thumbnail
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewTile {
    pub index: u32,
    /// Seconds from the start of the media
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// Finite, non-restartable tile sequence. It ends after the last tile or
/// after the first error.
pub type PreviewStream = BoxStream<'static, Result<PreviewTile, PreviewError>>;

/// Timestamps of the tiles for a media of `duration` seconds
pub fn tile_timestamps(duration: f64, max_tiles: u32) -> Vec<f64> {
    if !duration.is_finite() || duration <= 0.0 || max_tiles == 0 {
        return Vec::new();
    }
    let count = (duration.floor() as u64).min(max_tiles as u64).max(1);
    let interval = duration / count as f64;
    (0..count).map(|i| i as f64 * interval).collect()
}

#[derive(Clone)]
pub struct ScrubPreviewGenerator {
    decoder: Arc<dyn MediaDecoder>,
    jobs: DecodeJobs,
}

impl ScrubPreviewGenerator {
    pub fn new(decoder: Arc<dyn MediaDecoder>, jobs: DecodeJobs) -> Self {
        ScrubPreviewGenerator { decoder, jobs }
    }

    /// Build the tile sequence for `path`. Nothing is decoded until the
    /// stream is polled; dropping it kills any capture still running.
    pub fn generate(&self, path: &Path, options: PreviewOptions) -> PreviewStream {
        if let Err(e) = options.validate() {
            return stream::once(async move { Err(e) }).boxed();
        }

        let state = PreviewState {
            decoder: self.decoder.clone(),
            path: path.to_path_buf(),
            deadline: None,
            scope: self.jobs.scope(JobOwner::new_preview()),
            options,
            pending: None,
            ready: VecDeque::new(),
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if let Some(tile) = state.ready.pop_front() {
                return Some((Ok(tile), state));
            }
            if state.done {
                return None;
            }
            match state.advance().await {
                Ok(()) => state.ready.pop_front().map(|tile| (Ok(tile), state)),
                Err(e) => {
                    state.done = true;
                    let released = state.scope.release();
                    warn!(
                        "ScrubPreviewGenerator: {} failed: {} ({} captures aborted)",
                        state.path.display(),
                        e,
                        released
                    );
                    Some((Err(e), state))
                }
            }
        })
        .boxed()
    }
}

struct PreviewState {
    decoder: Arc<dyn MediaDecoder>,
    path: PathBuf,
    options: PreviewOptions,
    /// Starts on first poll
    deadline: Option<Instant>,
    scope: JobScope,
    /// Timestamps not yet captured, known after the probe
    pending: Option<VecDeque<(u32, f64)>>,
    ready: VecDeque<PreviewTile>,
    done: bool,
}

impl PreviewState {
    fn deadline(&mut self) -> Instant {
        *self
            .deadline
            .get_or_insert_with(|| Instant::now() + self.options.timeout)
    }

    /// Capture the next chunk into `ready`, marking the state done once every
    /// timestamp has been captured
    async fn advance(&mut self) -> Result<(), PreviewError> {
        let deadline = self.deadline();

        if self.pending.is_none() {
            let decoder = self.decoder.clone();
            let path = self.path.clone();
            let probe = self.scope.spawn(async move { decoder.probe(&path).await });
            let probe = timeout_at(deadline, probe)
                .await
                .map_err(|_| PreviewError::Timeout(self.options.timeout))?
                .map_err(|e| PreviewError::Task(e.to_string()))??;

            let duration = probe.duration.ok_or(PreviewError::NoDuration)?;
            let timestamps = tile_timestamps(duration, self.options.max_tiles);
            if timestamps.is_empty() {
                return Err(PreviewError::NoDuration);
            }
            debug!(
                "ScrubPreviewGenerator: {} tiles over {}s for {}",
                timestamps.len(),
                duration,
                self.path.display()
            );
            self.pending = Some((0u32..).zip(timestamps).collect());
        }

        let chunk: Vec<(u32, f64)> = match self.pending.as_mut() {
            Some(pending) => {
                let take = pending.len().min(PREVIEW_CHUNK_SIZE);
                pending.drain(..take).collect()
            }
            None => Vec::new(),
        };
        if chunk.is_empty() {
            self.done = true;
            return Ok(());
        }

        let captures: Vec<_> = chunk
            .iter()
            .map(|&(_, timestamp)| {
                let decoder = self.decoder.clone();
                let path = self.path.clone();
                let request = FrameRequest {
                    at: timestamp,
                    width: self.options.tile_width,
                    height: self.options.tile_height,
                    quality: self.options.quality,
                };
                self.scope
                    .spawn(async move { decoder.capture_frame(&path, &request).await })
            })
            .collect();

        let results = timeout_at(deadline, futures::future::join_all(captures))
            .await
            .map_err(|_| PreviewError::Timeout(self.options.timeout))?;

        for ((index, timestamp), result) in chunk.into_iter().zip(results) {
            let bytes = result.map_err(|e| PreviewError::Task(e.to_string()))??;
            self.ready.push_back(PreviewTile {
                index,
                timestamp,
                width: self.options.tile_width,
                height: self.options.tile_height,
                bytes,
            });
        }

        if self.pending.as_ref().map(|p| p.is_empty()).unwrap_or(true) {
            self.done = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_timestamps_evenly_spaced() {
        let timestamps = tile_timestamps(10.0, 100);
        assert_eq!(timestamps.len(), 10);
        assert_eq!(timestamps[0], 0.0);
        assert!((timestamps[9] - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_tile_timestamps_capped() {
        let timestamps = tile_timestamps(3600.0, 100);
        assert_eq!(timestamps.len(), 100);
        assert!((timestamps[1] - 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_tile_timestamps_short_media() {
        assert_eq!(tile_timestamps(0.5, 10), vec![0.0]);
        assert!(tile_timestamps(0.0, 10).is_empty());
        assert!(tile_timestamps(f64::NAN, 10).is_empty());
    }

    #[test]
    fn test_options_validation() {
        assert!(PreviewOptions::default().validate().is_ok());
        let bad = PreviewOptions {
            quality: 0.0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(PreviewError::InvalidOptions(_))));
    }
}
