//! Media probing.
//!
//! The driver asks a [`MediaProber`] for the input's duration and frame rate
//! before the encode starts, to seed the total-frame estimate. Probe failures
//! are never fatal; the estimator falls back to weaker signals.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of an input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

/// One stream of the probed input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub kind: StreamKind,
    /// Codec name (e.g., "hevc", "aac", "subrip").
    pub codec_name: String,
}

/// What the driver needs to know about an input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MediaInfo {
    pub duration_secs: Option<f64>,
    /// Frame rate of the first video stream.
    pub fps: Option<f64>,
    pub streams: Vec<StreamInfo>,
}

/// Media prober contract.
pub trait MediaProber: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;
}

/// Prober backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    bin: PathBuf,
}

impl FfprobeProber {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

impl MediaProber for FfprobeProber {
    /// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
    /// and parses the JSON output.
    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let output = Command::new(&self.bin)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parses an ffprobe rate such as `24000/1001` or `25`.
///
/// Returns `None` for `0/0` and other degenerate rates.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Parses ffprobe JSON output into a MediaInfo.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let mut fps = None;
    let mut streams = Vec::new();

    for stream in ffprobe.streams.unwrap_or_default() {
        let kind = match stream.codec_type.as_deref().unwrap_or("") {
            "video" => StreamKind::Video,
            "audio" => StreamKind::Audio,
            "subtitle" => StreamKind::Subtitle,
            _ => StreamKind::Other,
        };

        if kind == StreamKind::Video && fps.is_none() {
            fps = stream
                .avg_frame_rate
                .as_deref()
                .and_then(parse_frame_rate)
                .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));
        }

        streams.push(StreamInfo {
            kind,
            codec_name: stream.codec_name.unwrap_or_default(),
        });
    }

    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0);

    Ok(MediaInfo {
        duration_secs,
        fps,
        streams,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_frame_rate_fraction(num in 1u32..240_000, den in 1u32..2_000) {
            let rate = parse_frame_rate(&format!("{}/{}", num, den)).unwrap();
            prop_assert!((rate - num as f64 / den as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate("24000/1001").unwrap() - 23.976).abs() < 0.001);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_parse_ffprobe_output_basic() {
        let json = r#"{
            "streams": [
                {
                    "codec_type": "video",
                    "codec_name": "hevc",
                    "r_frame_rate": "24000/1001",
                    "avg_frame_rate": "24000/1001"
                },
                {
                    "codec_type": "audio",
                    "codec_name": "aac"
                },
                {
                    "codec_type": "subtitle",
                    "codec_name": "subrip"
                }
            ],
            "format": {
                "duration": "7200.5"
            }
        }"#;

        let info = parse_ffprobe_output(json).expect("Should parse valid JSON");

        assert!((info.duration_secs.unwrap() - 7200.5).abs() < 0.001);
        assert!((info.fps.unwrap() - 23.976).abs() < 0.001);
        assert_eq!(info.streams.len(), 3);
        assert_eq!(info.streams[0].kind, StreamKind::Video);
        assert_eq!(info.streams[2].kind, StreamKind::Subtitle);
        assert_eq!(info.streams[2].codec_name, "subrip");
    }

    #[test]
    fn test_parse_ffprobe_output_falls_back_to_r_frame_rate() {
        let json = r#"{
            "streams": [
                { "codec_type": "video", "r_frame_rate": "25/1", "avg_frame_rate": "0/0" }
            ],
            "format": {}
        }"#;

        let info = parse_ffprobe_output(json).unwrap();
        assert_eq!(info.fps, Some(25.0));
        assert!(info.duration_secs.is_none());
    }

    #[test]
    fn test_parse_ffprobe_output_invalid_json() {
        assert!(matches!(
            parse_ffprobe_output("not json"),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[test]
    fn test_missing_binary_is_error() {
        let prober = FfprobeProber::new("/nonexistent/ffprobe");
        assert!(prober.probe(Path::new("/tmp/x.mkv")).is_err());
    }
}
