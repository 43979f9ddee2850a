//! Job model for the transcode queue.
//!
//! A [`Job`] is one requested transcode with its options, status and
//! telemetry. Status changes go through [`Job::transition`], which enforces
//! the job state machine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by job model operations.
#[derive(Debug, Error, PartialEq)]
pub enum JobError {
    /// Requested status change is not part of the state machine.
    #[error("invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// The job spec is missing a required path.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for an admission slot.
    Queued,
    /// Encoder process is running.
    Processing,
    /// Encoder finished; output is being finalized.
    Verifying,
    /// Output committed to its final location.
    Completed,
    /// Encode, finalization or restart interruption failure.
    Failed,
    /// Withdrawn before it was admitted.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Verifying => write!(f, "verifying"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    /// Whether `self -> next` is an edge of the job state machine.
    ///
    /// queued -> processing | cancelled, processing -> verifying | failed,
    /// verifying -> completed | failed. Terminal states have no exits.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Verifying)
                | (Processing, Failed)
                | (Verifying, Completed)
                | (Verifying, Failed)
        )
    }

    /// Completed, failed and cancelled jobs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Processing and verifying jobs hold an admission slot.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::Verifying)
    }
}

/// Hardware decode acceleration passed to the engine as `-hwaccel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HwAccel {
    #[default]
    None,
    Auto,
    Cuda,
    Vaapi,
    Qsv,
    Videotoolbox,
}

impl HwAccel {
    /// Engine name for the mode, `None` when acceleration is off.
    pub fn engine_name(self) -> Option<&'static str> {
        match self {
            HwAccel::None => None,
            HwAccel::Auto => Some("auto"),
            HwAccel::Cuda => Some("cuda"),
            HwAccel::Vaapi => Some("vaapi"),
            HwAccel::Qsv => Some("qsv"),
            HwAccel::Videotoolbox => Some("videotoolbox"),
        }
    }
}

/// Target frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Encoder options resolved from a preset by an external collaborator.
///
/// Every codec left unset maps to a pass-through copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EncodeOptions {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub subtitle_codec: Option<String>,
    /// Constant rate factor for the video encoder.
    pub quality: Option<u8>,
    /// Encoder speed preset, e.g. `medium` or `6`.
    pub preset: Option<String>,
    pub hw_accel: HwAccel,
    pub resolution: Option<Resolution>,
    /// Extra video filters appended after scaling.
    pub video_filters: Vec<String>,
    pub audio_channels: Option<u32>,
    pub audio_bitrate_kbps: Option<u32>,
}

/// Input stream indices to map, per stream type.
///
/// Empty lists mean "first video stream, every audio and subtitle stream".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TrackSelection {
    pub video: Vec<usize>,
    pub audio: Vec<usize>,
    pub subtitle: Vec<usize>,
}

/// Caller-supplied description of a transcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub input_path: PathBuf,
    #[serde(default)]
    pub output_path: PathBuf,
    #[serde(default)]
    pub overwrite_input: bool,
    #[serde(default)]
    pub track_selection: TrackSelection,
    #[serde(default)]
    pub preset_ref: Option<String>,
    #[serde(default)]
    pub options: EncodeOptions,
}

impl JobSpec {
    /// Checks the paths a job cannot run without.
    ///
    /// The output path may be empty only when the input is overwritten.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.input_path.as_os_str().is_empty() {
            return Err(JobError::InvalidSpec("input path is empty".to_string()));
        }
        if !self.overwrite_input && self.output_path.as_os_str().is_empty() {
            return Err(JobError::InvalidSpec(
                "output path is empty and overwrite_input is not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Summary of a completed transcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub final_path: PathBuf,
    #[serde(rename = "initialSizeMB")]
    pub initial_size_mb: f64,
    #[serde(rename = "finalSizeMB")]
    pub final_size_mb: f64,
    pub reduction_percent: f64,
}

/// Represents a transcode job with full metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub overwrite_input: bool,
    /// Higher runs first.
    pub priority: i32,
    pub status: JobStatus,
    /// Completion percentage in [0, 100].
    pub progress: f64,
    pub fps: Option<f64>,
    pub frame: Option<u64>,
    pub total_frames: Option<u64>,
    /// Present only when status is failed.
    pub error: Option<String>,
    pub result: Option<JobResult>,
    /// Unix timestamp (milliseconds) when the job was queued.
    pub added_at: i64,
    pub processing_start_time: Option<i64>,
    pub processing_end_time: Option<i64>,
    #[serde(default)]
    pub track_selection: TrackSelection,
    #[serde(default)]
    pub preset_ref: Option<String>,
    #[serde(default)]
    pub options: EncodeOptions,
    /// Log artifact, set when the job is admitted.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Job {
    /// Creates a queued job from a spec, assigning a fresh UUID and `added_at`.
    pub fn new(spec: JobSpec, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            input_path: spec.input_path,
            output_path: spec.output_path,
            overwrite_input: spec.overwrite_input,
            priority,
            status: JobStatus::Queued,
            progress: 0.0,
            fps: None,
            frame: None,
            total_frames: None,
            error: None,
            result: None,
            added_at: current_timestamp_ms(),
            processing_start_time: None,
            processing_end_time: None,
            track_selection: spec.track_selection,
            preset_ref: spec.preset_ref,
            options: spec.options,
            log_path: None,
        }
    }

    /// Where the committed output ends up.
    pub fn final_path(&self) -> &Path {
        if self.overwrite_input {
            &self.input_path
        } else {
            &self.output_path
        }
    }

    /// Moves the job along the state machine, stamping processing times.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        match next {
            JobStatus::Processing => self.processing_start_time = Some(current_timestamp_ms()),
            JobStatus::Completed | JobStatus::Failed => {
                self.processing_end_time = Some(current_timestamp_ms())
            }
            _ => {}
        }
        Ok(())
    }

    /// Marks the job as failed with a reason.
    pub fn fail(&mut self, reason: &str) -> Result<(), JobError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(reason.to_string());
        Ok(())
    }

    /// Marks the job as completed with its result.
    pub fn complete(&mut self, result: JobResult) -> Result<(), JobError> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100.0;
        self.error = None;
        self.result = Some(result);
        Ok(())
    }

    /// Folds a progress sample into the job.
    ///
    /// Only processing jobs accept telemetry and progress never moves backwards.
    /// Returns whether anything was applied.
    pub fn apply_progress(&mut self, sample: &crate::progress::ProgressSample) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.progress = sample.percent.clamp(0.0, 100.0).max(self.progress);
        if sample.fps.is_some() {
            self.fps = sample.fps;
        }
        if sample.frame.is_some() {
            self.frame = sample.frame;
        }
        if sample.total_frames.is_some() {
            self.total_frames = sample.total_frames;
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
