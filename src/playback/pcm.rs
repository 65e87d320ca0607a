use std::fs::File;
use std::path::Path;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PcmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Symphonia error: {0}")]
    Symphonia(#[from] SymphoniaError),
    #[error("No audio tracks found")]
    NoAudioTracks,
}

/// Streaming reader over a cached WAV asset, yielding stereo f32 frames
pub struct PcmReader {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    frames: Vec<[f32; 2]>,
    frame_pos: usize,
    /// Frames handed out since the start of the asset
    consumed: u64,
    ended: bool,
}

impl PcmReader {
    pub fn open(path: &Path) -> Result<Self, PcmError> {
        let file = File::open(path)?;
        let media_source = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        hint.with_extension("wav");

        let probed = symphonia::default::get_probe().format(
            &hint,
            media_source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(PcmError::NoAudioTracks)?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .unwrap_or(crate::decode::ASSET_SAMPLE_RATE);
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())?;

        Ok(PcmReader {
            format_reader,
            decoder,
            track_id,
            sample_rate,
            frames: Vec::new(),
            frame_pos: 0,
            consumed: 0,
            ended: false,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Position in seconds of the next frame to be handed out
    pub fn position(&self) -> f64 {
        self.consumed as f64 / self.sample_rate as f64
    }

    /// Next stereo frame, `None` at end of stream
    pub fn next_frame(&mut self) -> Option<[f32; 2]> {
        if self.frame_pos >= self.frames.len() && !self.refill() {
            return None;
        }
        let frame = self.frames[self.frame_pos];
        self.frame_pos += 1;
        self.consumed += 1;
        Some(frame)
    }

    fn refill(&mut self) -> bool {
        self.frames.clear();
        self.frame_pos = 0;
        if self.ended {
            return false;
        }

        loop {
            let packet = match self.format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.ended = true;
                    return false;
                }
                Err(e) => {
                    warn!("PcmReader: Read error, treating as end of stream: {}", e);
                    self.ended = true;
                    return false;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // Corrupt packet, skip it
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("PcmReader: Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!("PcmReader: Decoder error, treating as end of stream: {}", e);
                    self.ended = true;
                    return false;
                }
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count().max(1);
            let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            samples.copy_interleaved_ref(decoded);

            self.frames.extend(samples.samples().chunks_exact(channels).map(|frame| {
                if channels == 1 {
                    [frame[0], frame[0]]
                } else {
                    [frame[0], frame[1]]
                }
            }));

            if !self.frames.is_empty() {
                return true;
            }
        }
    }

    /// Seek to `position` seconds. Seeking past the end leaves the reader
    /// ended at the requested position.
    pub fn seek(&mut self, position: f64) -> Result<(), PcmError> {
        let position = position.max(0.0);
        let secs = position.floor() as u64;
        let seek_time = Time::new(secs, position.fract());

        self.frames.clear();
        self.frame_pos = 0;
        self.decoder.reset();

        match self.format_reader.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time: seek_time,
                track_id: Some(self.track_id),
            },
        ) {
            Ok(seeked) => {
                self.ended = false;
                self.consumed = seeked.actual_ts;
                // Discard frames between the packet boundary and the target
                let mut skip = seeked.required_ts.saturating_sub(seeked.actual_ts);
                while skip > 0 && self.next_frame().is_some() {
                    skip -= 1;
                }
                Ok(())
            }
            Err(SymphoniaError::SeekError(_)) => {
                self.ended = true;
                self.consumed = (position * self.sample_rate as f64) as u64;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// 16-bit stereo PCM WAV with `frames` frames of a constant value
    pub(crate) fn write_wav(path: &Path, sample_rate: u32, frames: u32) {
        let data_len = frames * 4;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 4).to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for _ in 0..frames {
            bytes.extend_from_slice(&8192i16.to_le_bytes());
            bytes.extend_from_slice(&(-8192i16).to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_reads_every_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wav");
        write_wav(&path, 8000, 8000);

        let mut reader = PcmReader::open(&path).unwrap();
        assert_eq!(reader.sample_rate(), 8000);

        let first = reader.next_frame().unwrap();
        assert!((first[0] - 0.25).abs() < 1e-3);
        assert!((first[1] + 0.25).abs() < 1e-3);

        let mut count = 1;
        while reader.next_frame().is_some() {
            count += 1;
        }
        assert_eq!(count, 8000);
        assert!(reader.is_ended());
        assert!((reader.position() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_seek_moves_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wav");
        write_wav(&path, 8000, 16000);

        let mut reader = PcmReader::open(&path).unwrap();
        reader.seek(1.5).unwrap();
        assert!((reader.position() - 1.5).abs() < 0.01);
        assert!(reader.next_frame().is_some());
    }
}
