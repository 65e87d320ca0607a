// Test support utilities for both unit and integration tests

use crate::decode::{
    CodecType, DecodeError, FrameRequest, MediaDecoder, ProbeResult, ProbedStream,
};
use crate::import::MediaHandle;
use crate::playback::{OpenedTimelines, Timeline, TimelineBackend, TimelineError};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bytes written for every successfully demuxed asset unless overridden
pub const MOCK_ASSET_BYTES: usize = 1024;

struct MockDecoderSettings {
    streams: Vec<ProbedStream>,
    duration: Option<f64>,
    failing_streams: HashSet<u32>,
    asset_bytes: usize,
    demux_delay: Option<Duration>,
    frame_delay: Option<Duration>,
}

/// Mock decode capability
///
/// Writes placeholder assets instead of running ffmpeg and counts every
/// call so tests can assert the decoder was (or was not) touched.
pub struct MockDecoder {
    settings: Mutex<MockDecoderSettings>,
    probe_calls: AtomicUsize,
    demux_calls: AtomicUsize,
    frame_calls: AtomicUsize,
    frames_in_flight: AtomicUsize,
    max_frames_in_flight: AtomicUsize,
}

impl MockDecoder {
    /// One video stream followed by `audio_streams` audio streams
    pub fn with_audio_streams(audio_streams: u32) -> Self {
        let mut streams = vec![ProbedStream {
            index: 0,
            codec_type: CodecType::Video,
        }];
        streams.extend((0..audio_streams).map(|i| ProbedStream {
            index: i + 1,
            codec_type: CodecType::Audio,
        }));
        Self::with_streams(streams, Some(120.0))
    }

    pub fn with_streams(streams: Vec<ProbedStream>, duration: Option<f64>) -> Self {
        MockDecoder {
            settings: Mutex::new(MockDecoderSettings {
                streams,
                duration,
                failing_streams: HashSet::new(),
                asset_bytes: MOCK_ASSET_BYTES,
                demux_delay: None,
                frame_delay: None,
            }),
            probe_calls: AtomicUsize::new(0),
            demux_calls: AtomicUsize::new(0),
            frame_calls: AtomicUsize::new(0),
            frames_in_flight: AtomicUsize::new(0),
            max_frames_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make demux of the given audio ordinal fail after writing partial output
    pub fn fail_stream(&self, audio_ordinal: u32) {
        lock(&self.settings).failing_streams.insert(audio_ordinal);
    }

    pub fn clear_failures(&self) {
        lock(&self.settings).failing_streams.clear();
    }

    pub fn set_duration(&self, duration: Option<f64>) {
        lock(&self.settings).duration = duration;
    }

    pub fn set_asset_bytes(&self, bytes: usize) {
        lock(&self.settings).asset_bytes = bytes;
    }

    pub fn set_demux_delay(&self, delay: Duration) {
        lock(&self.settings).demux_delay = Some(delay);
    }

    pub fn set_frame_delay(&self, delay: Duration) {
        lock(&self.settings).frame_delay = Some(delay);
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn demux_calls(&self) -> usize {
        self.demux_calls.load(Ordering::SeqCst)
    }

    pub fn frame_calls(&self) -> usize {
        self.frame_calls.load(Ordering::SeqCst)
    }

    /// Highest number of frame captures observed running at once
    pub fn max_frames_in_flight(&self) -> usize {
        self.max_frames_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl MediaDecoder for MockDecoder {
    async fn probe(&self, _path: &Path) -> Result<ProbeResult, DecodeError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let settings = lock(&self.settings);
        Ok(ProbeResult {
            streams: settings.streams.clone(),
            duration: settings.duration,
        })
    }

    async fn demux_audio(
        &self,
        _path: &Path,
        audio_ordinal: u32,
        output: &Path,
    ) -> Result<(), DecodeError> {
        self.demux_calls.fetch_add(1, Ordering::SeqCst);
        let (fails, bytes, delay) = {
            let settings = lock(&self.settings);
            (
                settings.failing_streams.contains(&audio_ordinal),
                settings.asset_bytes,
                settings.demux_delay,
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if fails {
            tokio::fs::write(output, b"partial").await?;
            return Err(DecodeError::Failed {
                program: "mock".to_string(),
                status: "exit status: 1".to_string(),
                stderr: format!("stream {} is corrupt", audio_ordinal),
            });
        }

        tokio::fs::write(output, vec![0u8; bytes]).await?;
        Ok(())
    }

    async fn capture_frame(
        &self,
        _path: &Path,
        request: &FrameRequest,
    ) -> Result<Vec<u8>, DecodeError> {
        self.frame_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.frames_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_frames_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.frames_in_flight);

        let delay = lock(&self.settings).frame_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(&request.at.to_le_bytes());
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        Ok(jpeg)
    }
}

/// Observable state of one mock timeline
#[derive(Debug, Clone, PartialEq)]
pub struct MockTimelineState {
    pub position: f64,
    pub playing: bool,
    pub gain: f32,
    pub speed: f32,
    pub released: bool,
}

impl Default for MockTimelineState {
    fn default() -> Self {
        MockTimelineState {
            position: 0.0,
            playing: false,
            gain: 1.0,
            speed: 1.0,
            released: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimelineOp {
    Play,
    Pause,
    Seek(f64),
    SetGain(f32),
    SetSpeed(f32),
    Release,
}

/// One recorded call: session (open order), timeline (0 = primary) and op
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineEvent {
    pub session: usize,
    pub timeline: usize,
    pub op: TimelineOp,
}

#[derive(Default)]
struct MockTimelineShared {
    sessions: Vec<Vec<MockTimelineState>>,
    events: Vec<TimelineEvent>,
    failing_releases: HashSet<usize>,
    failing_seeks: HashSet<usize>,
    fail_open: bool,
}

/// Timeline backend whose timelines only record what they were told.
///
/// Primary timelines never advance on their own; tests move them with
/// `set_primary_position`.
#[derive(Clone, Default)]
pub struct MockTimelineBackend {
    shared: Arc<Mutex<MockTimelineShared>>,
}

impl MockTimelineBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of timeline `index` (0 = primary) of the `session`-th open
    pub fn timeline(&self, session: usize, index: usize) -> Option<MockTimelineState> {
        lock(&self.shared)
            .sessions
            .get(session)
            .and_then(|timelines| timelines.get(index))
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.shared).sessions.len()
    }

    pub fn set_primary_position(&self, session: usize, position: f64) {
        if let Some(primary) = lock(&self.shared)
            .sessions
            .get_mut(session)
            .and_then(|timelines| timelines.first_mut())
        {
            primary.position = position;
        }
    }

    /// Drift a track away from the primary
    pub fn set_track_position(&self, session: usize, index: usize, position: f64) {
        if let Some(timeline) = lock(&self.shared)
            .sessions
            .get_mut(session)
            .and_then(|timelines| timelines.get_mut(index))
        {
            timeline.position = position;
        }
    }

    /// Make `release` fail for timeline `index` of every session
    pub fn fail_release(&self, index: usize) {
        lock(&self.shared).failing_releases.insert(index);
    }

    /// Make `seek` fail for timeline `index` of every session
    pub fn fail_seek(&self, index: usize) {
        lock(&self.shared).failing_seeks.insert(index);
    }

    pub fn fail_open(&self, fail: bool) {
        lock(&self.shared).fail_open = fail;
    }

    pub fn events(&self) -> Vec<TimelineEvent> {
        lock(&self.shared).events.clone()
    }

    pub fn clear_events(&self) {
        lock(&self.shared).events.clear();
    }
}

impl TimelineBackend for MockTimelineBackend {
    fn open(&self, handle: &MediaHandle) -> Result<OpenedTimelines, TimelineError> {
        let mut shared = lock(&self.shared);
        if shared.fail_open {
            return Err(TimelineError::Open {
                path: handle.video.display().to_string(),
                reason: "mock open failure".to_string(),
            });
        }

        let session = shared.sessions.len();
        shared
            .sessions
            .push(vec![MockTimelineState::default(); handle.tracks.len() + 1]);
        drop(shared);

        let timeline = |index| -> Box<dyn Timeline> {
            Box::new(MockTimeline {
                shared: self.shared.clone(),
                session,
                index,
            })
        };
        Ok(OpenedTimelines {
            primary: timeline(0),
            tracks: (1..=handle.tracks.len()).map(timeline).collect(),
        })
    }
}

struct MockTimeline {
    shared: Arc<Mutex<MockTimelineShared>>,
    session: usize,
    index: usize,
}

impl MockTimeline {
    fn apply(
        &self,
        op: TimelineOp,
        f: impl FnOnce(&mut MockTimelineState),
    ) -> Result<(), TimelineError> {
        let mut shared = lock(&self.shared);
        shared.events.push(TimelineEvent {
            session: self.session,
            timeline: self.index,
            op,
        });
        let fail_release = op == TimelineOp::Release && shared.failing_releases.contains(&self.index);
        let fail_seek =
            matches!(op, TimelineOp::Seek(_)) && shared.failing_seeks.contains(&self.index);

        let state = &mut shared.sessions[self.session][self.index];
        if state.released {
            return Err(TimelineError::Released);
        }
        if fail_release {
            return Err(TimelineError::Device("mock release failure".to_string()));
        }
        if fail_seek {
            return Err(TimelineError::Seek {
                position: match op {
                    TimelineOp::Seek(position) => position,
                    _ => 0.0,
                },
                reason: "mock seek failure".to_string(),
            });
        }
        f(state);
        Ok(())
    }

    fn state(&self) -> MockTimelineState {
        lock(&self.shared).sessions[self.session][self.index].clone()
    }
}

impl Timeline for MockTimeline {
    fn play(&mut self) -> Result<(), TimelineError> {
        self.apply(TimelineOp::Play, |s| s.playing = true)
    }

    fn pause(&mut self) -> Result<(), TimelineError> {
        self.apply(TimelineOp::Pause, |s| s.playing = false)
    }

    fn seek(&mut self, position: f64) -> Result<(), TimelineError> {
        self.apply(TimelineOp::Seek(position), |s| s.position = position)
    }

    fn position(&self) -> f64 {
        self.state().position
    }

    fn is_playing(&self) -> bool {
        self.state().playing
    }

    fn set_gain(&mut self, gain: f32) -> Result<(), TimelineError> {
        self.apply(TimelineOp::SetGain(gain), |s| s.gain = gain)
    }

    fn set_speed(&mut self, speed: f32) -> Result<(), TimelineError> {
        self.apply(TimelineOp::SetSpeed(speed), |s| s.speed = speed)
    }

    fn release(&mut self) -> Result<(), TimelineError> {
        self.apply(TimelineOp::Release, |s| {
            s.playing = false;
            s.released = true;
        })
    }
}
