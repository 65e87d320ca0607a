use crate::import::MediaHandle;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimelineError {
    #[error("Audio device not available: {0}")]
    Device(String),
    #[error("Failed to open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("Seek to {position}s failed: {reason}")]
    Seek { position: f64, reason: String },
    #[error("Timeline already released")]
    Released,
}

/// One independently seekable, playable stream.
///
/// Positions are in seconds of media time.
pub trait Timeline: Send {
    fn play(&mut self) -> Result<(), TimelineError>;
    fn pause(&mut self) -> Result<(), TimelineError>;
    fn seek(&mut self, position: f64) -> Result<(), TimelineError>;
    fn position(&self) -> f64;
    fn is_playing(&self) -> bool;
    /// Effective output gain, already composed with master volume and mute
    fn set_gain(&mut self, gain: f32) -> Result<(), TimelineError>;
    fn set_speed(&mut self, speed: f32) -> Result<(), TimelineError>;
    /// Stop output and free decoder resources. Further calls fail with
    /// `Released`.
    fn release(&mut self) -> Result<(), TimelineError>;
}

/// Timelines for one session: the primary (video) plus one per audio track
/// in stream-index order
pub struct OpenedTimelines {
    pub primary: Box<dyn Timeline>,
    pub tracks: Vec<Box<dyn Timeline>>,
}

/// Creates the timelines for a media handle.
///
/// `open` may block; the playback service runs it off the async workers.
pub trait TimelineBackend: Send + Sync {
    fn open(&self, handle: &MediaHandle) -> Result<OpenedTimelines, TimelineError>;
}

/// Wall-clock primary timeline for the video stream.
///
/// Video frames are rendered by the UI from the original file; this clock
/// is the authoritative position the audio tracks are forced onto.
pub struct VideoClock {
    duration: Option<f64>,
    /// Position when the clock was last anchored
    anchor_position: f64,
    /// Set while playing
    anchor_instant: Option<Instant>,
    speed: f32,
    released: bool,
}

impl VideoClock {
    pub fn new(duration: Option<f64>) -> Self {
        VideoClock {
            duration,
            anchor_position: 0.0,
            anchor_instant: None,
            speed: 1.0,
            released: false,
        }
    }

    fn clamp(&self, position: f64) -> f64 {
        let position = position.max(0.0);
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn check(&self) -> Result<(), TimelineError> {
        if self.released {
            Err(TimelineError::Released)
        } else {
            Ok(())
        }
    }

    /// Fold elapsed playing time into the anchor
    fn reanchor(&mut self) {
        self.anchor_position = self.position();
        if self.anchor_instant.is_some() {
            self.anchor_instant = Some(Instant::now());
        }
    }
}

impl Timeline for VideoClock {
    fn play(&mut self) -> Result<(), TimelineError> {
        self.check()?;
        if self.anchor_instant.is_none() {
            self.anchor_instant = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), TimelineError> {
        self.check()?;
        self.anchor_position = self.position();
        self.anchor_instant = None;
        Ok(())
    }

    fn seek(&mut self, position: f64) -> Result<(), TimelineError> {
        self.check()?;
        self.anchor_position = self.clamp(position);
        if self.anchor_instant.is_some() {
            self.anchor_instant = Some(Instant::now());
        }
        Ok(())
    }

    fn position(&self) -> f64 {
        let elapsed = self
            .anchor_instant
            .map(|at| at.elapsed().as_secs_f64() * self.speed as f64)
            .unwrap_or(0.0);
        self.clamp(self.anchor_position + elapsed)
    }

    fn is_playing(&self) -> bool {
        self.anchor_instant.is_some()
    }

    fn set_gain(&mut self, _gain: f32) -> Result<(), TimelineError> {
        // The video stream carries no audio of its own
        self.check()
    }

    fn set_speed(&mut self, speed: f32) -> Result<(), TimelineError> {
        self.check()?;
        self.reanchor();
        self.speed = speed;
        Ok(())
    }

    fn release(&mut self) -> Result<(), TimelineError> {
        self.check()?;
        self.anchor_position = self.position();
        self.anchor_instant = None;
        self.released = true;
        Ok(())
    }
}
