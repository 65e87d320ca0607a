use crate::db::{DbAudioTrack, PlaybackSnapshot};
use crate::fingerprint::ContentId;
use serde::Serialize;
use std::path::PathBuf;

/// One playable audio asset of a media handle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackHandle {
    pub track_id: String,
    pub stream_index: u32,
    pub asset_path: PathBuf,
    pub volume: f32,
    pub muted: bool,
}

impl TrackHandle {
    pub fn from_record(track: &DbAudioTrack, asset_path: PathBuf) -> Self {
        TrackHandle {
            track_id: track.id.clone(),
            stream_index: track.stream_index,
            asset_path,
            volume: track.volume,
            muted: track.muted,
        }
    }
}

/// Everything the playback controller needs to open a session.
///
/// The video stream is never demuxed; it plays straight from `video`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaHandle {
    pub content_id: ContentId,
    pub video: PathBuf,
    pub duration: Option<f64>,
    /// Ordered by stream index
    pub tracks: Vec<TrackHandle>,
    /// Persisted state to restore the session from
    pub playback: PlaybackSnapshot,
}

/// A single audio stream that could not be demuxed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackFailure {
    pub stream_index: u32,
    pub error: String,
}

/// Result of a successful ingestion
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Served from the cache without touching the decoder
    Hit(MediaHandle),
    /// Freshly demuxed, every audio stream succeeded
    Miss(MediaHandle),
    /// Freshly demuxed with some audio streams degraded to absent
    PartialFailure {
        handle: MediaHandle,
        failures: Vec<TrackFailure>,
    },
}

impl IngestOutcome {
    pub fn handle(&self) -> &MediaHandle {
        match self {
            IngestOutcome::Hit(handle) | IngestOutcome::Miss(handle) => handle,
            IngestOutcome::PartialFailure { handle, .. } => handle,
        }
    }

    pub fn into_handle(self) -> MediaHandle {
        match self {
            IngestOutcome::Hit(handle) | IngestOutcome::Miss(handle) => handle,
            IngestOutcome::PartialFailure { handle, .. } => handle,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, IngestOutcome::Hit(_))
    }

    pub fn failures(&self) -> &[TrackFailure] {
        match self {
            IngestOutcome::PartialFailure { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Progress updates during ingestion
#[derive(Debug, Clone, PartialEq)]
pub enum IngestProgress {
    Started {
        content_id: ContentId,
        audio_streams: u32,
    },
    TrackComplete {
        content_id: ContentId,
        stream_index: u32,
    },
    TrackFailed {
        content_id: ContentId,
        stream_index: u32,
        error: String,
    },
    Complete {
        content_id: ContentId,
        tracks: usize,
    },
}
