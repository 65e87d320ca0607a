use super::{
    CodecType, DecodeError, FrameRequest, MediaDecoder, ProbeResult, ProbedStream,
    ASSET_CHANNELS, ASSET_SAMPLE_RATE,
};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, trace};

const STDERR_TAIL_CHARS: usize = 512;

/// `MediaDecoder` backed by ffmpeg/ffprobe subprocesses.
///
/// Every child is spawned with `kill_on_drop`, so dropping or aborting the
/// future that awaits it terminates the process.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: Option<CodecType>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, ffprobe_path: impl Into<PathBuf>) -> Self {
        FfmpegDecoder {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    async fn run(&self, program: &Path, args: Vec<OsString>) -> Result<Output, DecodeError> {
        trace!("Running {} {:?}", program.display(), args);
        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| DecodeError::Spawn {
                program: program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(DecodeError::Failed {
                program: program.display().to_string(),
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(output)
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        FfmpegDecoder::new("ffmpeg", "ffprobe")
    }
}

#[async_trait::async_trait]
impl MediaDecoder for FfmpegDecoder {
    async fn probe(&self, path: &Path) -> Result<ProbeResult, DecodeError> {
        let args = vec![
            "-v".into(),
            "error".into(),
            "-print_format".into(),
            "json".into(),
            "-show_streams".into(),
            "-show_format".into(),
            path.as_os_str().to_owned(),
        ];
        let output = self.run(&self.ffprobe_path, args).await?;
        let probe = parse_probe_output(&output.stdout)?;
        debug!(
            "Probed {}: {} streams, duration {:?}",
            path.display(),
            probe.streams.len(),
            probe.duration
        );
        Ok(probe)
    }

    async fn demux_audio(
        &self,
        path: &Path,
        audio_ordinal: u32,
        output: &Path,
    ) -> Result<(), DecodeError> {
        let args = vec![
            "-v".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            path.as_os_str().to_owned(),
            "-map".into(),
            format!("0:a:{}", audio_ordinal).into(),
            "-vn".into(),
            "-acodec".into(),
            "pcm_s16le".into(),
            "-ar".into(),
            ASSET_SAMPLE_RATE.to_string().into(),
            "-ac".into(),
            ASSET_CHANNELS.to_string().into(),
            "-f".into(),
            "wav".into(),
            output.as_os_str().to_owned(),
        ];
        self.run(&self.ffmpeg_path, args).await?;
        debug!(
            "Demuxed audio stream {} of {} to {}",
            audio_ordinal,
            path.display(),
            output.display()
        );
        Ok(())
    }

    async fn capture_frame(
        &self,
        path: &Path,
        request: &FrameRequest,
    ) -> Result<Vec<u8>, DecodeError> {
        let args = vec![
            "-v".into(),
            "error".into(),
            "-ss".into(),
            format!("{:.3}", request.at.max(0.0)).into(),
            "-i".into(),
            path.as_os_str().to_owned(),
            "-frames:v".into(),
            "1".into(),
            "-vf".into(),
            format!("scale={}:{}", request.width, request.height).into(),
            "-q:v".into(),
            jpeg_qscale(request.quality).to_string().into(),
            "-f".into(),
            "image2pipe".into(),
            "-vcodec".into(),
            "mjpeg".into(),
            "pipe:1".into(),
        ];
        let output = self.run(&self.ffmpeg_path, args).await?;
        if output.stdout.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(output.stdout)
    }
}

fn parse_probe_output(stdout: &[u8]) -> Result<ProbeResult, DecodeError> {
    let parsed: FfprobeOutput =
        serde_json::from_slice(stdout).map_err(|e| DecodeError::ProbeOutput(e.to_string()))?;

    let mut streams: Vec<ProbedStream> = parsed
        .streams
        .into_iter()
        .map(|s| ProbedStream {
            index: s.index,
            codec_type: s.codec_type.unwrap_or(CodecType::Unknown),
        })
        .collect();
    streams.sort_by_key(|s| s.index);

    let duration = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0);

    Ok(ProbeResult { streams, duration })
}

/// Map quality in (0, 1] onto mjpeg's qscale, 2 (best) to 31 (worst)
fn jpeg_qscale(quality: f32) -> u32 {
    let quality = if quality.is_finite() {
        quality.clamp(0.0, 1.0)
    } else {
        1.0
    };
    (2.0 + (1.0 - quality) * 29.0).round() as u32
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        let json = br#"{
            "streams": [
                {"index": 1, "codec_type": "audio", "codec_name": "aac"},
                {"index": 0, "codec_type": "video", "codec_name": "h264"},
                {"index": 2, "codec_type": "audio"},
                {"index": 3, "codec_type": "weird"}
            ],
            "format": {"duration": "42.500000"}
        }"#;

        let probe = parse_probe_output(json).unwrap();
        assert_eq!(probe.streams.len(), 4);
        assert_eq!(probe.streams[0].codec_type, CodecType::Video);
        assert_eq!(probe.streams[3].codec_type, CodecType::Unknown);
        assert_eq!(probe.audio_stream_count(), 2);
        assert_eq!(probe.duration, Some(42.5));
    }

    #[test]
    fn test_parse_probe_without_streams() {
        let probe = parse_probe_output(br#"{"format": {}}"#).unwrap();
        assert!(probe.streams.is_empty());
        assert_eq!(probe.duration, None);
    }

    #[test]
    fn test_parse_probe_rejects_garbage() {
        assert!(matches!(
            parse_probe_output(b"not json"),
            Err(DecodeError::ProbeOutput(_))
        ));
    }

    #[test]
    fn test_jpeg_qscale_bounds() {
        assert_eq!(jpeg_qscale(1.0), 2);
        assert_eq!(jpeg_qscale(0.0), 31);
        assert_eq!(jpeg_qscale(f32::NAN), 2);
    }
}
