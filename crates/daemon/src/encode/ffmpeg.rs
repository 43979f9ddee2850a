//! ffmpeg engine adapter
//!
//! Builds the ffmpeg invocation for a job and parses the key/value telemetry
//! ffmpeg writes with `-progress pipe:1`.

use crate::job::{EncodeOptions, Job, TrackSelection};
use crate::progress::{RawProgress, ESTIMATE_CAP};
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Codec name meaning "pass the stream through unchanged".
pub const COPY: &str = "copy";

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The input file is gone.
    #[error("input file not found: {0}")]
    InputMissing(String),

    /// ffmpeg could not be started.
    #[error("failed to start ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),

    /// ffmpeg exited with non-zero status
    #[error("ffmpeg exited with code {code}: {stderr_tail}")]
    Exited { code: i32, stderr_tail: String },

    /// ffmpeg was terminated by a signal
    #[error("ffmpeg was terminated by a signal: {stderr_tail}")]
    Terminated { stderr_tail: String },

    /// IO error while supervising the process
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn codec_or_copy(codec: &Option<String>) -> &str {
    codec.as_deref().filter(|c| !c.is_empty()).unwrap_or(COPY)
}

fn push<S: Into<OsString>>(args: &mut Vec<OsString>, values: impl IntoIterator<Item = S>) {
    args.extend(values.into_iter().map(Into::into));
}

fn push_maps(args: &mut Vec<OsString>, selection: &TrackSelection) {
    if selection.video.is_empty() {
        push(args, ["-map", "0:v:0"]);
    } else {
        for index in &selection.video {
            push(args, ["-map".to_string(), format!("0:v:{}", index)]);
        }
    }

    if selection.audio.is_empty() {
        push(args, ["-map", "0:a?"]);
    } else {
        for index in &selection.audio {
            push(args, ["-map".to_string(), format!("0:a:{}", index)]);
        }
    }

    if selection.subtitle.is_empty() {
        push(args, ["-map", "0:s?"]);
    } else {
        for index in &selection.subtitle {
            push(args, ["-map".to_string(), format!("0:s:{}", index)]);
        }
    }
}

fn push_video(args: &mut Vec<OsString>, options: &EncodeOptions) {
    let codec = codec_or_copy(&options.video_codec);
    push(args, ["-c:v", codec]);
    if codec == COPY {
        return;
    }

    if let Some(crf) = options.quality {
        push(args, ["-crf".to_string(), crf.to_string()]);
    }
    if let Some(preset) = options.preset.as_deref().filter(|p| !p.is_empty()) {
        push(args, ["-preset", preset]);
    }

    let mut filters = Vec::new();
    if let Some(res) = options.resolution {
        filters.push(format!("scale={}:{}", res.width, res.height));
    }
    filters.extend(options.video_filters.iter().filter(|f| !f.is_empty()).cloned());
    if !filters.is_empty() {
        push(args, ["-vf".to_string(), filters.join(",")]);
    }
}

fn push_audio(args: &mut Vec<OsString>, options: &EncodeOptions) {
    let codec = codec_or_copy(&options.audio_codec);
    push(args, ["-c:a", codec]);
    if codec == COPY {
        return;
    }

    if let Some(channels) = options.audio_channels {
        push(args, ["-ac".to_string(), channels.to_string()]);
    }
    if let Some(kbps) = options.audio_bitrate_kbps {
        push(args, ["-b:a".to_string(), format!("{}k", kbps)]);
    }
}

/// Builds the ffmpeg argument list for a job writing to `temp_output`.
///
/// Layout: global flags, optional `-hwaccel`, input, stream maps, per-type
/// codecs (unset codecs copy), progress reporting, output.
pub fn build_ffmpeg_args(job: &Job, temp_output: &Path) -> Vec<OsString> {
    let mut args = Vec::new();
    push(&mut args, ["-y", "-nostdin", "-hide_banner"]);

    if let Some(mode) = job.options.hw_accel.engine_name() {
        push(&mut args, ["-hwaccel", mode]);
    }
    push(&mut args, [OsString::from("-i"), job.input_path.clone().into_os_string()]);

    push_maps(&mut args, &job.track_selection);
    push_video(&mut args, &job.options);
    push_audio(&mut args, &job.options);
    push(&mut args, ["-c:s", codec_or_copy(&job.options.subtitle_codec)]);

    push(&mut args, ["-progress", "pipe:1", "-nostats"]);
    args.push(temp_output.as_os_str().to_owned());
    args
}

/// Builds the ffmpeg command with piped stdout (progress) and stderr (log).
pub fn build_ffmpeg_command(bin: &Path, args: &[OsString]) -> Command {
    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Renders an argument list as a single line for the job log.
pub fn display_command(bin: &Path, args: &[OsString]) -> String {
    let mut line = bin.display().to_string();
    for arg in args {
        let arg = arg.to_string_lossy();
        line.push(' ');
        if arg.contains(' ') {
            line.push('"');
            line.push_str(&arg);
            line.push('"');
        } else {
            line.push_str(&arg);
        }
    }
    line
}

/// Parses `HH:MM:SS.micro` as emitted in `out_time=`.
fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.trim().splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Accumulates one `-progress` block and emits it on its `progress=` line.
#[derive(Debug, Default)]
pub struct ProgressParser {
    duration_secs: Option<f64>,
    current: RawProgress,
}

impl ProgressParser {
    /// `duration_secs` is the probed input duration, used to derive a percent.
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| *d > 0.0),
            current: RawProgress::default(),
        }
    }

    /// Feeds one stdout line. Returns a record when a block is complete.
    pub fn feed(&mut self, line: &str) -> Option<RawProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key {
            "frame" => {
                self.current.frame = value.parse::<u64>().ok().filter(|f| *f > 0);
            }
            "fps" => {
                self.current.fps = value.parse::<f64>().ok().filter(|f| *f > 0.0);
            }
            // out_time_ms is microseconds as well
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<f64>() {
                    if us > 0.0 {
                        self.current.out_time_secs = Some(us / 1_000_000.0);
                    }
                }
            }
            "out_time" => {
                if self.current.out_time_secs.is_none() {
                    self.current.out_time_secs = parse_clock(value).filter(|t| *t > 0.0);
                }
            }
            "speed" => {
                if value != "N/A" {
                    self.current.status_text = Some(format!("speed {}", value));
                }
            }
            "progress" => {
                let mut block = std::mem::take(&mut self.current);
                if let (Some(time), Some(duration)) = (block.out_time_secs, self.duration_secs) {
                    // out_time overshoots the probed duration on the last block
                    block.percent = Some((100.0 * time / duration).min(ESTIMATE_CAP));
                }
                return Some(block);
            }
            _ => {}
        }
        None
    }
}
