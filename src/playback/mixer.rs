// # Audio Mixer
//
// Every audio track of a session is a `Voice` mixed into a single cpal output
// stream. The stream is not `Send`, so it lives on a dedicated thread for the
// mixer's whole lifetime and is dropped there on shutdown.
//
// Control state (playing, gain, speed) is atomic so the audio callback never
// blocks on the playback service. The callback only `try_lock`s a voice's
// reader; a voice that is being seeked is silent for that buffer.

use crate::import::MediaHandle;
use crate::playback::pcm::PcmReader;
use crate::playback::timeline::{OpenedTimelines, Timeline, TimelineBackend, TimelineError, VideoClock};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Seeks closer than this to the current position are skipped
const SEEK_TOLERANCE_SECS: f64 = 0.02;

struct VoiceCursor {
    reader: PcmReader,
    /// Fractional source frames owed to the output
    phase: f64,
    current: [f32; 2],
}

struct Voice {
    cursor: Mutex<VoiceCursor>,
    sample_rate: u32,
    playing: AtomicBool,
    gain: AtomicU32,
    speed: AtomicU32,
    /// Frames consumed, published by the audio callback
    position_frames: AtomicU64,
}

impl Voice {
    fn new(reader: PcmReader) -> Self {
        let sample_rate = reader.sample_rate();
        Voice {
            cursor: Mutex::new(VoiceCursor {
                reader,
                phase: 0.0,
                current: [0.0; 2],
            }),
            sample_rate,
            playing: AtomicBool::new(false),
            gain: AtomicU32::new(1.0f32.to_bits()),
            speed: AtomicU32::new(1.0f32.to_bits()),
            position_frames: AtomicU64::new(0),
        }
    }

    fn lock_cursor(&self) -> MutexGuard<'_, VoiceCursor> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mix this voice into `out` (interleaved, `channels` per frame)
    fn render(&self, out: &mut [f32], channels: usize, output_rate: u32) {
        if !self.playing.load(Ordering::Relaxed) {
            return;
        }
        let Ok(mut cursor) = self.cursor.try_lock() else {
            return;
        };

        let gain = f32::from_bits(self.gain.load(Ordering::Relaxed));
        let speed = f32::from_bits(self.speed.load(Ordering::Relaxed)) as f64;
        let step = speed * self.sample_rate as f64 / output_rate as f64;

        for frame in out.chunks_exact_mut(channels) {
            cursor.phase += step;
            while cursor.phase >= 1.0 {
                cursor.phase -= 1.0;
                cursor.current = cursor.reader.next_frame().unwrap_or([0.0; 2]);
            }
            let [left, right] = cursor.current;
            match frame.len() {
                1 => frame[0] += (left + right) * 0.5 * gain,
                _ => {
                    frame[0] += left * gain;
                    frame[1] += right * gain;
                }
            }
        }

        if cursor.reader.is_ended() {
            self.playing.store(false, Ordering::Relaxed);
        }
        self.position_frames
            .store(position_frames(&cursor.reader), Ordering::Relaxed);
    }
}

fn position_frames(reader: &PcmReader) -> u64 {
    (reader.position() * reader.sample_rate() as f64) as u64
}

type VoiceList = Arc<Mutex<Vec<Arc<Voice>>>>;

fn lock_voices(voices: &VoiceList) -> MutexGuard<'_, Vec<Arc<Voice>>> {
    voices.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns the output device thread
pub struct AudioMixer {
    voices: VoiceList,
    shutdown_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioMixer {
    pub fn start() -> Result<Self, TimelineError> {
        let voices: VoiceList = Arc::new(Mutex::new(Vec::new()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), TimelineError>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let stream_voices = voices.clone();
        let thread = std::thread::Builder::new()
            .name("tandem-audio".to_string())
            .spawn(move || {
                let stream = match build_stream(stream_voices) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns on shutdown or when the mixer is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("AudioMixer: Output stream closed");
            })
            .map_err(|e| TimelineError::Device(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| TimelineError::Device("audio thread exited".to_string()))??;

        Ok(AudioMixer {
            voices,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    fn add(&self, voice: Arc<Voice>) {
        lock_voices(&self.voices).push(voice);
    }

    pub fn voice_count(&self) -> usize {
        lock_voices(&self.voices).len()
    }
}

impl Drop for AudioMixer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("AudioMixer: Audio thread panicked");
            }
        }
    }
}

fn build_stream(voices: VoiceList) -> Result<cpal::Stream, TimelineError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| TimelineError::Device("no output device".to_string()))?;
    let default_config = device
        .default_output_config()
        .map_err(|e| TimelineError::Device(e.to_string()))?;
    let stream_config = cpal::StreamConfig::from(default_config);

    let channels = stream_config.channels as usize;
    let output_rate = stream_config.sample_rate.0;
    info!("Audio device: {} channels, {} Hz", channels, output_rate);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                data.fill(0.0);
                let Ok(voices) = voices.try_lock() else {
                    return;
                };
                for voice in voices.iter() {
                    voice.render(data, channels, output_rate);
                }
                for sample in data.iter_mut() {
                    *sample = sample.clamp(-1.0, 1.0);
                }
            },
            |err| {
                error!("Audio stream error: {:?}", err);
            },
            None,
        )
        .map_err(|e| TimelineError::Device(e.to_string()))?;

    stream
        .play()
        .map_err(|e| TimelineError::Device(e.to_string()))?;
    Ok(stream)
}

/// Track timeline backed by a voice in the shared mixer
pub struct VoiceTimeline {
    voice: Arc<Voice>,
    mixer: Arc<AudioMixer>,
    released: bool,
}

impl VoiceTimeline {
    /// Silence the voice and drop it from the mix, closing its reader
    fn detach(&mut self) {
        self.voice.playing.store(false, Ordering::Relaxed);
        lock_voices(&self.mixer.voices).retain(|voice| !Arc::ptr_eq(voice, &self.voice));
        self.released = true;
    }

    fn check(&self) -> Result<(), TimelineError> {
        if self.released {
            Err(TimelineError::Released)
        } else {
            Ok(())
        }
    }
}

impl Timeline for VoiceTimeline {
    fn play(&mut self) -> Result<(), TimelineError> {
        self.check()?;
        self.voice.playing.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), TimelineError> {
        self.check()?;
        self.voice.playing.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn seek(&mut self, position: f64) -> Result<(), TimelineError> {
        self.check()?;
        if (self.position() - position).abs() < SEEK_TOLERANCE_SECS {
            return Ok(());
        }

        let mut cursor = self.voice.lock_cursor();
        cursor
            .reader
            .seek(position)
            .map_err(|e| TimelineError::Seek {
                position,
                reason: e.to_string(),
            })?;
        cursor.phase = 0.0;
        self.voice
            .position_frames
            .store(position_frames(&cursor.reader), Ordering::Relaxed);
        Ok(())
    }

    fn position(&self) -> f64 {
        self.voice.position_frames.load(Ordering::Relaxed) as f64 / self.voice.sample_rate as f64
    }

    fn is_playing(&self) -> bool {
        !self.released && self.voice.playing.load(Ordering::Relaxed)
    }

    fn set_gain(&mut self, gain: f32) -> Result<(), TimelineError> {
        self.check()?;
        self.voice.gain.store(gain.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn set_speed(&mut self, speed: f32) -> Result<(), TimelineError> {
        self.check()?;
        self.voice.speed.store(speed.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn release(&mut self) -> Result<(), TimelineError> {
        self.check()?;
        self.detach();
        Ok(())
    }
}

impl Drop for VoiceTimeline {
    fn drop(&mut self) {
        if !self.released {
            debug!("VoiceTimeline: Dropped without release, detaching voice");
            self.detach();
        }
    }
}

/// Plays cached assets through the default output device.
///
/// The device is opened on first use and shared by every later session.
#[derive(Default)]
pub struct AudioDeviceBackend {
    mixer: Mutex<Option<Arc<AudioMixer>>>,
}

impl AudioDeviceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn mixer(&self) -> Result<Arc<AudioMixer>, TimelineError> {
        let mut slot = self.mixer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mixer) = slot.as_ref() {
            return Ok(mixer.clone());
        }
        let mixer = Arc::new(AudioMixer::start()?);
        *slot = Some(mixer.clone());
        Ok(mixer)
    }
}

impl TimelineBackend for AudioDeviceBackend {
    fn open(&self, handle: &MediaHandle) -> Result<OpenedTimelines, TimelineError> {
        let mixer = self.mixer()?;

        let mut tracks: Vec<Box<dyn Timeline>> = Vec::with_capacity(handle.tracks.len());
        for track in &handle.tracks {
            let reader = match PcmReader::open(&track.asset_path) {
                Ok(reader) => reader,
                Err(e) => {
                    for mut opened in tracks {
                        let _ = opened.release();
                    }
                    return Err(TimelineError::Open {
                        path: track.asset_path.display().to_string(),
                        reason: e.to_string(),
                    });
                }
            };
            let voice = Arc::new(Voice::new(reader));
            mixer.add(voice.clone());
            tracks.push(Box::new(VoiceTimeline {
                voice,
                mixer: mixer.clone(),
                released: false,
            }));
        }

        debug!(
            "AudioDeviceBackend: Opened {} voices ({} mixed)",
            tracks.len(),
            mixer.voice_count()
        );

        Ok(OpenedTimelines {
            primary: Box::new(VideoClock::new(handle.duration)),
            tracks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::pcm::tests::write_wav;
    use tempfile::TempDir;

    /// Mixer with no output thread, for voice bookkeeping only
    fn silent_mixer() -> Arc<AudioMixer> {
        Arc::new(AudioMixer {
            voices: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx: None,
            thread: None,
        })
    }

    fn voice_timeline(mixer: &Arc<AudioMixer>, dir: &TempDir) -> VoiceTimeline {
        let path = dir.path().join("0.wav");
        write_wav(&path, 8000, 800);
        let voice = Arc::new(Voice::new(PcmReader::open(&path).unwrap()));
        mixer.add(voice.clone());
        VoiceTimeline {
            voice,
            mixer: mixer.clone(),
            released: false,
        }
    }

    #[test]
    fn test_dropped_timeline_leaves_the_mix() {
        let dir = TempDir::new().unwrap();
        let mixer = silent_mixer();
        let timeline = voice_timeline(&mixer, &dir);
        assert_eq!(mixer.voice_count(), 1);

        drop(timeline);
        assert_eq!(mixer.voice_count(), 0);
    }

    #[test]
    fn test_release_detaches_once() {
        let dir = TempDir::new().unwrap();
        let mixer = silent_mixer();
        let mut timeline = voice_timeline(&mixer, &dir);

        timeline.release().unwrap();
        assert_eq!(mixer.voice_count(), 0);
        assert_eq!(timeline.release(), Err(TimelineError::Released));
        assert_eq!(timeline.play(), Err(TimelineError::Released));
    }
}
