// # Playback Session
//
// One primary (video) timeline plus one timeline per audio track, kept in
// lock-step. The primary is authoritative: every tick forces each track onto
// the primary's position. Transport and gain changes are applied to every
// timeline before the call returns.

use crate::db::PlaybackSnapshot;
use crate::fingerprint::ContentId;
use crate::import::MediaHandle;
use crate::playback::service::PlaybackError;
use crate::playback::timeline::{OpenedTimelines, Timeline, TimelineError};
use std::iter;
use tracing::{debug, warn};

pub const MIN_PLAYBACK_SPEED: f32 = 0.25;
pub const MAX_PLAYBACK_SPEED: f32 = 4.0;

struct TrackTimeline {
    track_id: String,
    stream_index: u32,
    volume: f32,
    muted: bool,
    timeline: Box<dyn Timeline>,
}

/// Per-track state written back on teardown
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSnapshot {
    pub track_id: String,
    pub volume: f32,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub content_id: ContentId,
    pub playback: PlaybackSnapshot,
    pub tracks: Vec<TrackSnapshot>,
}

/// Per-track view for status reporting
#[derive(Debug, Clone, PartialEq)]
pub struct TrackStatus {
    pub track_id: String,
    pub stream_index: u32,
    pub volume: f32,
    pub muted: bool,
    pub effective_gain: f32,
    pub position: f64,
}

/// Result of one resync tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub position: f64,
    /// Set on the tick that paused the session at the end of the media
    pub ended: bool,
}

pub struct PlaybackSession {
    content_id: ContentId,
    duration: Option<f64>,
    primary: Box<dyn Timeline>,
    tracks: Vec<TrackTimeline>,
    master_volume: f32,
    master_muted: bool,
    speed: f32,
    playing: bool,
    /// Some while a scrub gesture is in progress; holds whether to resume
    scrub_resume: Option<bool>,
}

impl PlaybackSession {
    /// Build a paused session restored from the handle's persisted state
    pub fn open(handle: &MediaHandle, opened: OpenedTimelines) -> Result<Self, PlaybackError> {
        let OpenedTimelines {
            mut primary,
            mut tracks,
        } = opened;
        if tracks.len() != handle.tracks.len() {
            log_leaks(
                &handle.content_id,
                release_timelines(iter::once(&mut primary).chain(tracks.iter_mut())),
            );
            return Err(PlaybackError::Timeline(TimelineError::Open {
                path: handle.video.display().to_string(),
                reason: format!(
                    "backend opened {} timelines for {} tracks",
                    tracks.len(),
                    handle.tracks.len()
                ),
            }));
        }

        let tracks = handle
            .tracks
            .iter()
            .zip(tracks)
            .map(|(track, timeline)| TrackTimeline {
                track_id: track.track_id.clone(),
                stream_index: track.stream_index,
                volume: sanitize_volume(track.volume),
                muted: track.muted,
                timeline,
            })
            .collect();

        let mut session = PlaybackSession {
            content_id: handle.content_id.clone(),
            duration: handle.duration,
            primary,
            tracks,
            master_volume: sanitize_volume(handle.playback.volume),
            master_muted: handle.playback.muted,
            speed: clamp_speed(handle.playback.playback_speed),
            playing: false,
            scrub_resume: None,
        };

        let start = match session.restore(handle.playback.seek_position) {
            Ok(start) => start,
            Err(e) => {
                let (_, leaks) = session.teardown();
                log_leaks(&handle.content_id, leaks);
                return Err(e);
            }
        };

        debug!(
            "PlaybackSession: Opened {} with {} tracks at {}s",
            session.content_id,
            session.tracks.len(),
            start
        );
        Ok(session)
    }

    /// Apply persisted speed, gains and position to every timeline
    fn restore(&mut self, seek_position: f64) -> Result<f64, PlaybackError> {
        let speed = self.speed;
        self.for_each_timeline(|timeline| timeline.set_speed(speed))?;
        self.apply_all_gains()?;
        let start = self.clamp_position(seek_position);
        self.for_each_timeline(|timeline| timeline.seek(start))?;
        Ok(start)
    }

    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn position(&self) -> f64 {
        self.primary.position()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_scrubbing(&self) -> bool {
        self.scrub_resume.is_some()
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume
    }

    pub fn master_muted(&self) -> bool {
        self.master_muted
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Apply `f` to the primary and every track, reporting the first error
    /// only after all timelines were visited
    fn for_each_timeline(
        &mut self,
        mut f: impl FnMut(&mut dyn Timeline) -> Result<(), TimelineError>,
    ) -> Result<(), TimelineError> {
        let mut first_error = f(self.primary.as_mut()).err();
        for track in &mut self.tracks {
            if let Err(e) = f(track.timeline.as_mut()) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn clamp_position(&self, position: f64) -> f64 {
        let position = if position.is_finite() { position.max(0.0) } else { 0.0 };
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    pub fn play(&mut self) -> Result<(), PlaybackError> {
        if let Some(resume) = self.scrub_resume.as_mut() {
            *resume = true;
            return Ok(());
        }
        if self.playing {
            return Ok(());
        }
        self.for_each_timeline(|timeline| timeline.play())?;
        self.playing = true;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), PlaybackError> {
        if let Some(resume) = self.scrub_resume.as_mut() {
            *resume = false;
            return Ok(());
        }
        if !self.playing {
            return Ok(());
        }
        self.for_each_timeline(|timeline| timeline.pause())?;
        self.playing = false;
        Ok(())
    }

    /// Move every timeline to `position`, clamped to the media.
    ///
    /// While playing, all timelines are paused around the seek and resumed
    /// together so no track runs ahead of the video.
    pub fn seek(&mut self, position: f64) -> Result<f64, PlaybackError> {
        let target = self.clamp_position(position);
        if self.playing {
            self.for_each_timeline(|timeline| timeline.pause())?;
            self.for_each_timeline(|timeline| timeline.seek(target))?;
            self.for_each_timeline(|timeline| timeline.play())?;
        } else {
            self.for_each_timeline(|timeline| timeline.seek(target))?;
        }
        Ok(target)
    }

    /// Start a scrub gesture: everything pauses until `end_scrub`
    pub fn begin_scrub(&mut self) -> Result<(), PlaybackError> {
        if self.scrub_resume.is_some() {
            return Ok(());
        }
        let was_playing = self.playing;
        if was_playing {
            self.for_each_timeline(|timeline| timeline.pause())?;
            self.playing = false;
        }
        self.scrub_resume = Some(was_playing);
        Ok(())
    }

    /// Finish a scrub gesture, resuming all timelines together if playback
    /// was running when it began
    pub fn end_scrub(&mut self) -> Result<(), PlaybackError> {
        let Some(resume) = self.scrub_resume.take() else {
            return Ok(());
        };
        let position = self.position();
        self.for_each_timeline(|timeline| timeline.seek(position))?;
        if resume {
            self.for_each_timeline(|timeline| timeline.play())?;
            self.playing = true;
        }
        Ok(())
    }

    fn track_gain(&self, track: &TrackTimeline) -> f32 {
        if self.master_muted || track.muted {
            0.0
        } else {
            track.volume * self.master_volume
        }
    }

    /// Effective gain of track `index`
    pub fn effective_gain(&self, index: usize) -> Option<f32> {
        self.tracks.get(index).map(|track| self.track_gain(track))
    }

    fn apply_gain(&mut self, index: usize) -> Result<(), PlaybackError> {
        let Some(track) = self.tracks.get(index) else {
            return Err(PlaybackError::TrackOutOfRange(index));
        };
        let gain = self.track_gain(track);
        self.tracks[index].timeline.set_gain(gain)?;
        Ok(())
    }

    fn apply_all_gains(&mut self) -> Result<(), PlaybackError> {
        let mut first_error = None;
        for index in 0..self.tracks.len() {
            if let Err(e) = self.apply_gain(index) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn track_mut(&mut self, index: usize) -> Result<&mut TrackTimeline, PlaybackError> {
        self.tracks
            .get_mut(index)
            .ok_or(PlaybackError::TrackOutOfRange(index))
    }

    pub fn set_master_volume(&mut self, volume: f32) -> Result<(), PlaybackError> {
        self.master_volume = validate_volume(volume)?;
        self.apply_all_gains()
    }

    pub fn set_track_volume(&mut self, index: usize, volume: f32) -> Result<(), PlaybackError> {
        let volume = validate_volume(volume)?;
        self.track_mut(index)?.volume = volume;
        self.apply_gain(index)
    }

    pub fn set_master_muted(&mut self, muted: bool) -> Result<(), PlaybackError> {
        self.master_muted = muted;
        self.apply_all_gains()
    }

    pub fn set_track_muted(&mut self, index: usize, muted: bool) -> Result<(), PlaybackError> {
        self.track_mut(index)?.muted = muted;
        self.apply_gain(index)
    }

    /// Set the rate of every timeline, clamped to the supported range
    pub fn set_speed(&mut self, speed: f32) -> Result<f32, PlaybackError> {
        if !speed.is_finite() {
            return Err(PlaybackError::InvalidValue(format!("speed {}", speed)));
        }
        let speed = clamp_speed(speed);
        self.for_each_timeline(|timeline| timeline.set_speed(speed))?;
        self.speed = speed;
        Ok(speed)
    }

    /// Force every track onto the primary's position
    pub fn resync(&mut self) -> f64 {
        let position = self.primary.position();
        for track in &mut self.tracks {
            if let Err(e) = track.timeline.seek(position) {
                warn!(
                    "PlaybackSession: Resync of track {} failed: {}",
                    track.stream_index, e
                );
            }
        }
        position
    }

    /// Periodic resync; pauses at the end of the media
    pub fn tick(&mut self) -> Result<Tick, PlaybackError> {
        let position = self.primary.position();
        let at_end = self
            .duration
            .map(|duration| position >= duration)
            .unwrap_or(false);

        if self.playing && at_end {
            self.for_each_timeline(|timeline| timeline.pause())?;
            self.playing = false;
            let position = self.resync();
            return Ok(Tick {
                position,
                ended: true,
            });
        }

        Ok(Tick {
            position: self.resync(),
            ended: false,
        })
    }

    pub fn track_status(&self) -> Vec<TrackStatus> {
        self.tracks
            .iter()
            .map(|track| TrackStatus {
                track_id: track.track_id.clone(),
                stream_index: track.stream_index,
                volume: track.volume,
                muted: track.muted,
                effective_gain: self.track_gain(track),
                position: track.timeline.position(),
            })
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            content_id: self.content_id.clone(),
            playback: PlaybackSnapshot {
                playback_speed: self.speed,
                volume: self.master_volume,
                muted: self.master_muted,
                seek_position: self.position(),
            },
            tracks: self
                .tracks
                .iter()
                .map(|track| TrackSnapshot {
                    track_id: track.track_id.clone(),
                    volume: track.volume,
                    muted: track.muted,
                })
                .collect(),
        }
    }

    /// Release every timeline. Failures are returned, never raised, so a
    /// wedged timeline cannot block the next load.
    pub fn teardown(mut self) -> (SessionSnapshot, Vec<TimelineError>) {
        let snapshot = self.snapshot();
        let tracks = self.tracks.iter_mut().map(|track| &mut track.timeline);
        let leaks = release_timelines(iter::once(&mut self.primary).chain(tracks));
        (snapshot, leaks)
    }
}

/// Release every timeline, collecting the failures
fn release_timelines<'a>(
    timelines: impl IntoIterator<Item = &'a mut Box<dyn Timeline>>,
) -> Vec<TimelineError> {
    timelines
        .into_iter()
        .filter_map(|timeline| timeline.release().err())
        .collect()
}

fn log_leaks(content_id: &ContentId, leaks: Vec<TimelineError>) {
    for leak in leaks {
        warn!(
            "PlaybackSession: Leaked timeline of {} after failed open: {}",
            content_id, leak
        );
    }
}

fn validate_volume(volume: f32) -> Result<f32, PlaybackError> {
    if volume.is_finite() {
        Ok(volume.clamp(0.0, 1.0))
    } else {
        Err(PlaybackError::InvalidValue(format!("volume {}", volume)))
    }
}

fn sanitize_volume(volume: f32) -> f32 {
    validate_volume(volume).unwrap_or(crate::db::DEFAULT_VOLUME)
}

fn clamp_speed(speed: f32) -> f32 {
    if speed.is_finite() {
        speed.clamp(MIN_PLAYBACK_SPEED, MAX_PLAYBACK_SPEED)
    } else {
        crate::db::DEFAULT_PLAYBACK_SPEED
    }
}
