mod mixer;
mod pcm;
pub mod progress;
pub mod service;
mod session;
mod timeline;

pub use mixer::AudioDeviceBackend;
pub use pcm::{PcmError, PcmReader};
pub use progress::{PlaybackProgress, PlaybackProgressHandle};
pub use service::{
    PlaybackConfig, PlaybackError, PlaybackHandle, PlaybackService, PlaybackState,
    PlaybackStatus, Transport,
};
pub use session::{
    PlaybackSession, SessionSnapshot, Tick, TrackSnapshot, TrackStatus, MAX_PLAYBACK_SPEED,
    MIN_PLAYBACK_SPEED,
};
pub use timeline::{OpenedTimelines, Timeline, TimelineBackend, TimelineError, VideoClock};
