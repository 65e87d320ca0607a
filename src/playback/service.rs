use crate::fingerprint::ContentId;
use crate::import::MediaHandle;
use crate::playback::progress::{PlaybackProgress, PlaybackProgressHandle};
use crate::playback::session::{PlaybackSession, TrackStatus};
use crate::playback::timeline::{TimelineBackend, TimelineError};
use crate::store::{AssetStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_stream::Stream;
use tracing::{debug, error, info, warn};

/// Default interval between hard resyncs of the track timelines
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("No media loaded")]
    NotLoaded,
    #[error("Track index {0} out of range")]
    TrackOutOfRange(usize),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Superseded seek failed: {0}")]
    Coalesced(String),
    #[error("Timeline backend task failed: {0}")]
    Task(String),
    #[error("Playback service stopped")]
    ServiceStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Paused,
    Playing,
}

/// Current playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loaded(Transport),
}

/// Snapshot of the controller, returned by every command
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub content_id: Option<ContentId>,
    pub position: f64,
    pub duration: Option<f64>,
    pub scrubbing: bool,
    pub master_volume: f32,
    pub master_muted: bool,
    pub speed: f32,
    pub tracks: Vec<TrackStatus>,
}

impl PlaybackStatus {
    fn idle() -> Self {
        PlaybackStatus {
            state: PlaybackState::Idle,
            content_id: None,
            position: 0.0,
            duration: None,
            scrubbing: false,
            master_volume: crate::db::DEFAULT_VOLUME,
            master_muted: false,
            speed: crate::db::DEFAULT_PLAYBACK_SPEED,
            tracks: Vec::new(),
        }
    }
}

/// Playback commands sent to the service
#[derive(Debug, Clone)]
pub enum PlaybackCommand {
    Load(Box<MediaHandle>),
    Play,
    Pause,
    Seek(f64),
    BeginScrub,
    EndScrub,
    Stop,
    SetMasterVolume(f32),
    SetTrackVolume { index: usize, volume: f32 },
    SetMasterMuted(bool),
    SetTrackMuted { index: usize, muted: bool },
    SetSpeed(f32),
    Status,
}

type Reply = oneshot::Sender<Result<PlaybackStatus, PlaybackError>>;

struct Request {
    command: PlaybackCommand,
    reply: Reply,
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub resync_interval: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        PlaybackConfig {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }
}

/// Handle to the playback service for sending commands.
///
/// Every command resolves once the service has applied it.
#[derive(Clone)]
pub struct PlaybackHandle {
    command_tx: tokio_mpsc::UnboundedSender<Request>,
    progress_handle: PlaybackProgressHandle,
}

impl PlaybackHandle {
    async fn send(&self, command: PlaybackCommand) -> Result<PlaybackStatus, PlaybackError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Request { command, reply })
            .map_err(|_| PlaybackError::ServiceStopped)?;
        rx.await.map_err(|_| PlaybackError::ServiceStopped)?
    }

    /// Tear down any current session and open `handle`, paused
    pub async fn load(&self, handle: MediaHandle) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::Load(Box::new(handle))).await
    }

    pub async fn play(&self) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::Play).await
    }

    pub async fn pause(&self) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::Pause).await
    }

    pub async fn seek(&self, position: f64) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::Seek(position)).await
    }

    pub async fn begin_scrub(&self) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::BeginScrub).await
    }

    pub async fn end_scrub(&self) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::EndScrub).await
    }

    pub async fn stop(&self) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::Stop).await
    }

    pub async fn set_master_volume(&self, volume: f32) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::SetMasterVolume(volume)).await
    }

    pub async fn set_track_volume(
        &self,
        index: usize,
        volume: f32,
    ) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::SetTrackVolume { index, volume })
            .await
    }

    pub async fn set_master_muted(&self, muted: bool) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::SetMasterMuted(muted)).await
    }

    pub async fn set_track_muted(
        &self,
        index: usize,
        muted: bool,
    ) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::SetTrackMuted { index, muted })
            .await
    }

    pub async fn set_playback_speed(&self, speed: f32) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::SetSpeed(speed)).await
    }

    pub async fn status(&self) -> Result<PlaybackStatus, PlaybackError> {
        self.send(PlaybackCommand::Status).await
    }

    pub fn subscribe_progress(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        self.progress_handle.subscribe_all()
    }

    /// Position notifications for the current session, ending with it
    pub fn positions(&self) -> impl Stream<Item = f64> + Send + Unpin + 'static {
        self.progress_handle.positions()
    }
}

/// Playback service that owns the active session.
///
/// Commands are applied one at a time. Consecutive queued seeks collapse
/// into the last one.
pub struct PlaybackService {
    store: AssetStore,
    backend: Arc<dyn TimelineBackend>,
    command_rx: tokio_mpsc::UnboundedReceiver<Request>,
    progress_tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
    session: Option<PlaybackSession>,
    pending: Option<Request>,
    resync_interval: Duration,
}

impl PlaybackService {
    pub fn start(
        store: AssetStore,
        backend: Arc<dyn TimelineBackend>,
        config: PlaybackConfig,
        runtime_handle: tokio::runtime::Handle,
    ) -> PlaybackHandle {
        let (command_tx, command_rx) = tokio_mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = tokio_mpsc::unbounded_channel();

        let progress_handle = PlaybackProgressHandle::new(progress_rx, runtime_handle.clone());

        let service = PlaybackService {
            store,
            backend,
            command_rx,
            progress_tx,
            session: None,
            pending: None,
            resync_interval: config.resync_interval,
        };
        runtime_handle.spawn(service.run());

        PlaybackHandle {
            command_tx,
            progress_handle,
        }
    }

    async fn run(mut self) {
        info!("PlaybackService started");

        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let request = match self.pending.take() {
                Some(request) => request,
                None => tokio::select! {
                    request = self.command_rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                    _ = ticker.tick() => {
                        self.on_tick();
                        continue;
                    }
                },
            };
            self.handle_request(request).await;
        }

        self.teardown_session().await;
        info!("PlaybackService stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        let Request { command, reply } = request;

        if let PlaybackCommand::Seek(mut target) = command {
            let mut superseded = Vec::new();
            let mut reply = reply;
            while let Ok(next) = self.command_rx.try_recv() {
                match next.command {
                    PlaybackCommand::Seek(next_target) => {
                        debug!("PlaybackService: Seek to {} replaced by {}", target, next_target);
                        target = next_target;
                        superseded.push(std::mem::replace(&mut reply, next.reply));
                    }
                    _ => {
                        self.pending = Some(next);
                        break;
                    }
                }
            }

            let result = self.seek(target).map(|_| self.status());
            for earlier in superseded {
                let outcome = match &result {
                    Ok(status) => Ok(status.clone()),
                    Err(e) => Err(PlaybackError::Coalesced(e.to_string())),
                };
                let _ = earlier.send(outcome);
            }
            let _ = reply.send(result);
            return;
        }

        let result = self.apply(command).await.map(|_| self.status());
        let _ = reply.send(result);
    }

    async fn apply(&mut self, command: PlaybackCommand) -> Result<(), PlaybackError> {
        match command {
            PlaybackCommand::Load(handle) => self.load(*handle).await,
            PlaybackCommand::Play => {
                self.session_mut()?.play()?;
                self.emit_state();
                Ok(())
            }
            PlaybackCommand::Pause => {
                self.session_mut()?.pause()?;
                self.emit_state();
                Ok(())
            }
            PlaybackCommand::Seek(position) => self.seek(position),
            PlaybackCommand::BeginScrub => {
                self.session_mut()?.begin_scrub()?;
                self.emit_state();
                Ok(())
            }
            PlaybackCommand::EndScrub => {
                self.session_mut()?.end_scrub()?;
                self.emit_state();
                Ok(())
            }
            PlaybackCommand::Stop => {
                self.teardown_session().await;
                Ok(())
            }
            PlaybackCommand::SetMasterVolume(volume) => self.session_mut()?.set_master_volume(volume),
            PlaybackCommand::SetTrackVolume { index, volume } => {
                self.session_mut()?.set_track_volume(index, volume)
            }
            PlaybackCommand::SetMasterMuted(muted) => self.session_mut()?.set_master_muted(muted),
            PlaybackCommand::SetTrackMuted { index, muted } => {
                self.session_mut()?.set_track_muted(index, muted)
            }
            PlaybackCommand::SetSpeed(speed) => self.session_mut()?.set_speed(speed).map(|_| ()),
            PlaybackCommand::Status => Ok(()),
        }
    }

    fn session_mut(&mut self) -> Result<&mut PlaybackSession, PlaybackError> {
        self.session.as_mut().ok_or(PlaybackError::NotLoaded)
    }

    fn seek(&mut self, position: f64) -> Result<(), PlaybackError> {
        let position = self.session_mut()?.seek(position)?;
        let _ = self
            .progress_tx
            .send(PlaybackProgress::PositionChanged { position });
        Ok(())
    }

    async fn load(&mut self, handle: MediaHandle) -> Result<(), PlaybackError> {
        self.teardown_session().await;

        info!(
            "PlaybackService: Loading {} with {} tracks",
            handle.content_id,
            handle.tracks.len()
        );

        let backend = self.backend.clone();
        let (handle, opened) = tokio::task::spawn_blocking(move || {
            let opened = backend.open(&handle);
            (handle, opened)
        })
        .await
        .map_err(|e| PlaybackError::Task(e.to_string()))?;

        let session = PlaybackSession::open(&handle, opened?)?;
        let position = session.position();
        self.session = Some(session);

        let _ = self.progress_tx.send(PlaybackProgress::Loaded {
            content_id: handle.content_id.clone(),
            duration: handle.duration,
            tracks: handle.tracks.len(),
        });
        self.emit_state();
        let _ = self
            .progress_tx
            .send(PlaybackProgress::PositionChanged { position });
        Ok(())
    }

    /// Release the current session and persist its final state. Failures
    /// are logged; they never block what comes next.
    async fn teardown_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let (snapshot, leaks) = session.teardown();
        for leak in &leaks {
            error!(
                "PlaybackService: Leaked timeline of {}: {}",
                snapshot.content_id, leak
            );
        }

        if let Err(e) = self
            .store
            .save_playback_state(&snapshot.content_id, &snapshot.playback)
            .await
        {
            error!(
                "PlaybackService: Failed to persist state of {}: {}",
                snapshot.content_id, e
            );
        }
        for track in &snapshot.tracks {
            if let Err(e) = self
                .store
                .save_track_state(&track.track_id, track.volume, track.muted)
                .await
            {
                error!(
                    "PlaybackService: Failed to persist track {}: {}",
                    track.track_id, e
                );
            }
        }

        info!(
            "PlaybackService: Session {} closed at {}s",
            snapshot.content_id, snapshot.playback.seek_position
        );
        let _ = self.progress_tx.send(PlaybackProgress::StateChanged {
            state: PlaybackState::Idle,
        });
        let _ = self.progress_tx.send(PlaybackProgress::SessionEnded {
            content_id: snapshot.content_id,
        });
    }

    fn on_tick(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.is_playing() {
            return;
        }

        match session.tick() {
            Ok(tick) => {
                let _ = self.progress_tx.send(PlaybackProgress::PositionChanged {
                    position: tick.position,
                });
                if tick.ended {
                    info!("PlaybackService: Reached end at {}s", tick.position);
                    let _ = self.progress_tx.send(PlaybackProgress::Ended {
                        position: tick.position,
                    });
                    self.emit_state();
                }
            }
            Err(e) => warn!("PlaybackService: Resync failed: {}", e),
        }
    }

    fn state(&self) -> PlaybackState {
        match &self.session {
            None => PlaybackState::Idle,
            Some(session) if session.is_playing() => PlaybackState::Loaded(Transport::Playing),
            Some(_) => PlaybackState::Loaded(Transport::Paused),
        }
    }

    fn emit_state(&self) {
        let _ = self.progress_tx.send(PlaybackProgress::StateChanged {
            state: self.state(),
        });
    }

    fn status(&self) -> PlaybackStatus {
        let Some(session) = &self.session else {
            return PlaybackStatus::idle();
        };
        PlaybackStatus {
            state: self.state(),
            content_id: Some(session.content_id().clone()),
            position: session.position(),
            duration: session.duration(),
            scrubbing: session.is_scrubbing(),
            master_volume: session.master_volume(),
            master_muted: session.master_muted(),
            speed: session.speed(),
            tracks: session.track_status(),
        }
    }
}
