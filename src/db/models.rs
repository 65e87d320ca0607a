use crate::fingerprint::ContentId;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default playback speed/volume for newly ingested media
pub const DEFAULT_PLAYBACK_SPEED: f32 = 1.0;
pub const DEFAULT_VOLUME: f32 = 1.0;

/// Subtitle display defaults
pub const DEFAULT_SUBTITLE_SIZE: f32 = 1.0;
pub const DEFAULT_SUBTITLE_COLOR: &str = "#FFFFFF";

/// One row per distinct content id.
///
/// Created on the first ingestion of a new file and mutated when a playback
/// session is torn down. Only the cache governor deletes it, which cascades
/// to its audio tracks, subtitles and on-disk assets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbMediaRecord {
    pub content_id: ContentId,
    pub playback_speed: f32,
    pub volume: f32,
    pub muted: bool,
    /// Last persisted playback position in seconds
    pub seek_position: f64,
    /// Container duration in seconds, captured from the probe
    pub duration: Option<f64>,
    /// Set once every demux started for this entry has settled
    pub complete: bool,
    pub last_accessed: DateTime<Utc>,
}

impl DbMediaRecord {
    pub fn new(content_id: ContentId) -> Self {
        DbMediaRecord {
            content_id,
            playback_speed: DEFAULT_PLAYBACK_SPEED,
            volume: DEFAULT_VOLUME,
            muted: false,
            seek_position: 0.0,
            duration: None,
            complete: false,
            last_accessed: Utc::now(),
        }
    }

    pub fn playback(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            playback_speed: self.playback_speed,
            volume: self.volume,
            muted: self.muted,
            seek_position: self.seek_position,
        }
    }
}

/// One row per demuxed audio stream of a media record.
///
/// `stream_index` is the 0-based position of the stream among the audio
/// streams of the probed container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbAudioTrack {
    pub id: String,
    pub content_id: ContentId,
    pub stream_index: u32,
    pub volume: f32,
    pub muted: bool,
}

impl DbAudioTrack {
    pub fn new(content_id: ContentId, stream_index: u32) -> Self {
        DbAudioTrack {
            id: Uuid::new_v4().to_string(),
            content_id,
            stream_index,
            volume: DEFAULT_VOLUME,
            muted: false,
        }
    }
}

/// User supplied subtitle file attached to a media record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbSubtitle {
    pub id: String,
    pub content_id: ContentId,
    pub name: String,
    pub language: Option<String>,
    pub size: f32,
    pub color: String,
    /// Offset applied to cue timings, in seconds
    pub timing_adjustment: f64,
    pub file_path: String,
}

impl DbSubtitle {
    pub fn new(
        content_id: ContentId,
        name: &str,
        language: Option<&str>,
        file_path: String,
    ) -> Self {
        DbSubtitle {
            id: Uuid::new_v4().to_string(),
            content_id,
            name: name.to_string(),
            language: language.map(str::to_string),
            size: DEFAULT_SUBTITLE_SIZE,
            color: DEFAULT_SUBTITLE_COLOR.to_string(),
            timing_adjustment: 0.0,
            file_path,
        }
    }
}

/// Playback fields written back to a media record on session teardown
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub playback_speed: f32,
    pub volume: f32,
    pub muted: bool,
    pub seek_position: f64,
}

/// Keyset position in the least-recently-accessed ordering
#[derive(Debug, Clone, PartialEq)]
pub struct LruCursor {
    pub last_accessed: DateTime<Utc>,
    pub content_id: ContentId,
}

/// Render a timestamp so that lexical order equals chronological order
pub fn timestamp_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
