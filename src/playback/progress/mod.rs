pub mod handle;

use crate::fingerprint::ContentId;
use crate::playback::service::PlaybackState;
pub use handle::PlaybackProgressHandle;

/// Notifications published by the playback service
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackProgress {
    Loaded {
        content_id: ContentId,
        duration: Option<f64>,
        tracks: usize,
    },
    StateChanged {
        state: PlaybackState,
    },
    /// Primary timeline position after a resync tick or a seek
    PositionChanged {
        position: f64,
    },
    /// The primary timeline reached the end of the media
    Ended {
        position: f64,
    },
    /// Last notification of a session; subscriptions close after it
    SessionEnded {
        content_id: ContentId,
    },
}
