// # Decode Module
//
// The decode/probe capability is an external collaborator (ffmpeg/ffprobe
// subprocesses). Everything in the crate talks to it through `MediaDecoder`
// so tests can swap in a mock.
//
// - **MediaDecoder**: probe a container, demux one audio stream, grab a frame
// - **FfmpegDecoder**: subprocess implementation
// - **DecodeJobs**: ownership table of in-flight decode tasks

mod ffmpeg;
mod jobs;

pub use ffmpeg::FfmpegDecoder;
pub use jobs::{DecodeJobs, JobOwner, JobScope};

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Output sample rate of demuxed assets
pub const ASSET_SAMPLE_RATE: u32 = 44_100;
/// Output channel count of demuxed assets
pub const ASSET_CHANNELS: u16 = 2;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("Unparseable probe output: {0}")]
    ProbeOutput(String),
    #[error("Decoder produced no data")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    Video,
    Audio,
    Subtitle,
    Data,
    Attachment,
    #[serde(other)]
    Unknown,
}

/// One stream of a probed container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbedStream {
    /// Index of the stream within the container
    pub index: u32,
    pub codec_type: CodecType,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Streams in container order
    pub streams: Vec<ProbedStream>,
    /// Container duration in seconds, when known
    pub duration: Option<f64>,
}

impl ProbeResult {
    /// Number of audio streams, which is also the range of valid audio
    /// stream ordinals for `demux_audio`
    pub fn audio_stream_count(&self) -> u32 {
        self.streams
            .iter()
            .filter(|s| s.codec_type == CodecType::Audio)
            .count() as u32
    }
}

/// Parameters for a single still frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRequest {
    /// Timestamp in seconds
    pub at: f64,
    pub width: u32,
    pub height: u32,
    /// JPEG quality in (0, 1]
    pub quality: f32,
}

/// Probe/demux/frame capability
#[async_trait::async_trait]
pub trait MediaDecoder: Send + Sync {
    /// List the container's streams
    async fn probe(&self, path: &Path) -> Result<ProbeResult, DecodeError>;

    /// Extract the `audio_ordinal`-th audio stream to `output` as 16-bit PCM
    /// WAV, 44.1 kHz, stereo
    async fn demux_audio(
        &self,
        path: &Path,
        audio_ordinal: u32,
        output: &Path,
    ) -> Result<(), DecodeError>;

    /// Encode a single scaled frame at `request.at` as JPEG
    async fn capture_frame(
        &self,
        path: &Path,
        request: &FrameRequest,
    ) -> Result<Vec<u8>, DecodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_stream_count() {
        let probe = ProbeResult {
            streams: vec![
                ProbedStream { index: 0, codec_type: CodecType::Video },
                ProbedStream { index: 1, codec_type: CodecType::Audio },
                ProbedStream { index: 2, codec_type: CodecType::Subtitle },
                ProbedStream { index: 3, codec_type: CodecType::Audio },
            ],
            duration: Some(10.0),
        };
        assert_eq!(probe.audio_stream_count(), 2);
    }
}
