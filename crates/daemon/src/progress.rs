//! Progress estimation for a running encode.
//!
//! The encoder's telemetry is optional and noisy. [`ProgressEstimator`] turns
//! whatever signals are present into one percentage that stays in [0, 100],
//! never goes backwards and never claims completion before the terminal event.
//! It also drives the liveness watchdog that keeps a silent encode from
//! looking frozen.

use serde::Serialize;
use std::time::{Duration, Instant};
use transcode_queue_config::WatchdogConfig;

/// Liveness value used when no other signal is available.
pub const FLOOR_PERCENT: f64 = 0.1;
/// Upper bound for derived estimates until the encode has finished.
pub const ESTIMATE_CAP: f64 = 99.9;
/// Synthetic watchdog ticks never exceed this.
pub const LIVENESS_CAP: f64 = 1.0;

/// One raw telemetry record from the engine. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawProgress {
    /// Explicit completion percentage reported by the engine.
    pub percent: Option<f64>,
    pub frame: Option<u64>,
    /// Authoritative total frame count, when the engine knows it.
    pub total_frames: Option<u64>,
    pub fps: Option<f64>,
    /// Position of the encoder in the output timeline.
    pub out_time_secs: Option<f64>,
    pub status_text: Option<String>,
}

impl RawProgress {
    /// Whether the record carries a frame or percent signal.
    pub fn is_real_signal(&self) -> bool {
        self.percent.is_some() || self.frame.is_some()
    }
}

/// Normalized progress for one job, consumed by the queue and observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    pub job_id: String,
    pub percent: f64,
    pub fps: Option<f64>,
    pub frame: Option<u64>,
    pub total_frames: Option<u64>,
    pub status_text: Option<String>,
}

/// Timing of the liveness watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    /// Silence tolerated after start before ticks begin.
    pub grace: Duration,
    /// Spacing of synthetic ticks.
    pub interval: Duration,
    /// Ticks stop once this much time has passed after the grace window.
    pub max: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self::from(&WatchdogConfig::default())
    }
}

impl From<&WatchdogConfig> for WatchdogSettings {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            grace: Duration::from_millis(config.grace_ms),
            interval: Duration::from_millis(config.interval_ms.max(1)),
            max: Duration::from_millis(config.max_ms),
        }
    }
}

/// Estimates a percentage from one record, without any history.
///
/// Priority: explicit percent in [0, 100]; frame / total frames;
/// elapsed / duration; the liveness floor. Everything but the explicit
/// percent is capped at [`ESTIMATE_CAP`].
pub fn estimate_percent(
    raw: &RawProgress,
    elapsed: Duration,
    duration_secs: Option<f64>,
    total_frames: Option<u64>,
) -> f64 {
    if let Some(percent) = raw.percent {
        if (0.0..=100.0).contains(&percent) {
            return percent;
        }
    }

    if let (Some(frame), Some(total)) = (raw.frame, total_frames) {
        if total > 0 {
            return (100.0 * frame as f64 / total as f64).min(ESTIMATE_CAP);
        }
    }

    if let Some(duration) = duration_secs.filter(|d| *d > 0.0) {
        let elapsed = elapsed.as_secs_f64();
        if elapsed > 0.0 {
            return (100.0 * elapsed / duration).clamp(FLOOR_PERCENT, ESTIMATE_CAP);
        }
    }

    FLOOR_PERCENT
}

/// Per-job estimator state, owned by the driver for the life of one run.
#[derive(Debug)]
pub struct ProgressEstimator {
    job_id: String,
    started: Instant,
    duration_secs: Option<f64>,
    total_frames: Option<u64>,
    last_percent: f64,
    real_signal_seen: bool,
    finished: bool,
    watchdog: WatchdogSettings,
}

impl ProgressEstimator {
    /// Creates the estimator, deriving a total-frame estimate from the probe.
    pub fn new(
        job_id: impl Into<String>,
        started: Instant,
        duration_secs: Option<f64>,
        fps: Option<f64>,
        watchdog: WatchdogSettings,
    ) -> Self {
        let total_frames = match (duration_secs, fps) {
            (Some(d), Some(f)) if d > 0.0 && f > 0.0 => Some((d * f).round() as u64),
            _ => None,
        };
        Self {
            job_id: job_id.into(),
            started,
            duration_secs,
            total_frames,
            last_percent: 0.0,
            real_signal_seen: false,
            finished: false,
            watchdog,
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.duration_secs
    }

    pub fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    pub fn last_percent(&self) -> f64 {
        self.last_percent
    }

    /// Initial liveness sample at the floor, emitted before any telemetry.
    pub fn seed(&mut self) -> ProgressSample {
        self.report(FLOOR_PERCENT, None, None, Some("starting".to_string()))
    }

    /// Folds one engine record into the estimate.
    pub fn observe(&mut self, raw: RawProgress, now: Instant) -> ProgressSample {
        if let Some(total) = raw.total_frames.filter(|t| *t > 0) {
            self.total_frames = Some(total);
        }
        if raw.is_real_signal() {
            self.real_signal_seen = true;
        }
        let elapsed = now.saturating_duration_since(self.started);
        let percent = estimate_percent(&raw, elapsed, self.duration_secs, self.total_frames);
        self.report(percent, raw.fps, raw.frame, raw.status_text)
    }

    /// Synthetic tick for a silent encoder.
    ///
    /// Returns `None` inside the grace window, once a real signal has been
    /// seen, after the watchdog's maximum duration, or after the run ended.
    pub fn liveness_tick(&mut self, now: Instant) -> Option<ProgressSample> {
        if self.finished || self.real_signal_seen {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.started);
        let silent = elapsed.checked_sub(self.watchdog.grace)?;
        if silent > self.watchdog.max {
            return None;
        }

        let fraction = if self.watchdog.max.is_zero() {
            1.0
        } else {
            silent.as_secs_f64() / self.watchdog.max.as_secs_f64()
        };
        let tick = FLOOR_PERCENT + (LIVENESS_CAP - FLOOR_PERCENT) * fraction;
        Some(self.report(
            tick.min(LIVENESS_CAP),
            None,
            None,
            Some("waiting for encoder output".to_string()),
        ))
    }

    /// Whether the watchdog may still emit ticks.
    pub fn watchdog_active(&self, now: Instant) -> bool {
        !self.finished
            && !self.real_signal_seen
            && now.saturating_duration_since(self.started) <= self.watchdog.grace + self.watchdog.max
    }

    /// Terminal event: the engine exited successfully.
    pub fn finish(&mut self) -> ProgressSample {
        self.finished = true;
        self.last_percent = 100.0;
        ProgressSample {
            job_id: self.job_id.clone(),
            percent: 100.0,
            fps: None,
            frame: None,
            total_frames: self.total_frames,
            status_text: Some("encode finished".to_string()),
        }
    }

    fn report(
        &mut self,
        percent: f64,
        fps: Option<f64>,
        frame: Option<u64>,
        status_text: Option<String>,
    ) -> ProgressSample {
        let percent = percent.clamp(0.0, 100.0).max(self.last_percent);
        self.last_percent = percent;
        ProgressSample {
            job_id: self.job_id.clone(),
            percent,
            fps,
            frame,
            total_frames: self.total_frames,
            status_text,
        }
    }
}
