//! Transcode driver
//!
//! Runs exactly one ffmpeg process for a job: probes the input, spawns the
//! encoder against the job's `_tmp` output, turns its telemetry into progress
//! samples, and on a clean exit commits the output through [`finalize`].
//! On every outcome other than a committed success the temporary output is
//! removed.

use crate::encode::{
    build_ffmpeg_args, build_ffmpeg_command, display_command, EncodeError, ProgressParser,
};
use crate::finalize::{remove_with_retry, temp_output_path, try_finalize};
use crate::job::{Job, JobResult};
use crate::job_log::JobLog;
use crate::probe::{MediaInfo, MediaProber};
use crate::progress::{ProgressEstimator, ProgressSample, WatchdogSettings};
use crate::retry::RetryPolicy;
use crate::Config;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Number of stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 8;

/// Settings the driver needs from the configuration.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub ffmpeg_bin: PathBuf,
    pub log_dir: PathBuf,
    pub watchdog: WatchdogSettings,
    pub retry: RetryPolicy,
}

impl DriverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ffmpeg_bin: config.encoder.ffmpeg_bin.clone(),
            log_dir: config.paths.log_dir.clone(),
            watchdog: WatchdogSettings::from(&config.watchdog),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// Updates sent to the queue while a job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverUpdate {
    Progress(ProgressSample),
    /// The encoder exited cleanly and finalization is starting.
    Verifying,
}

/// Failure class of an unsuccessful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Encode,
    Finalize,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Encode => write!(f, "encode"),
            FailureKind::Finalize => write!(f, "finalize"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one driver run.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingResult {
    pub success: bool,
    pub output_path: PathBuf,
    pub initial_size_mb: f64,
    pub final_size_mb: f64,
    pub reduction_percent: f64,
    /// `<class>: <detail>`, set when `success` is false.
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl EncodingResult {
    fn failed(kind: FailureKind, output_path: &Path, detail: impl fmt::Display) -> Self {
        Self {
            success: false,
            output_path: output_path.to_path_buf(),
            initial_size_mb: 0.0,
            final_size_mb: 0.0,
            reduction_percent: 0.0,
            error: Some(format!("{}: {}", kind, detail)),
            failure: Some(kind),
        }
    }

    /// Summary stored on the job, for successful runs.
    pub fn job_result(&self) -> Option<JobResult> {
        self.success.then(|| JobResult {
            final_path: self.output_path.clone(),
            initial_size_mb: self.initial_size_mb,
            final_size_mb: self.final_size_mb,
            reduction_percent: self.reduction_percent,
        })
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Percentage saved going from `initial` to `final_size` bytes.
pub fn reduction_percent(initial: u64, final_size: u64) -> f64 {
    if initial == 0 {
        return 0.0;
    }
    (1.0 - final_size as f64 / initial as f64) * 100.0
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

fn forward_lines<R>(
    reader: R,
    tx: mpsc::UnboundedSender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        // Reads raw bytes: ffmpeg echoes metadata in whatever encoding the
        // container uses, and the pipe must stay drained until EOF.
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(&['\n', '\r'][..]).to_string();
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

/// Owns one encoder invocation per call to [`TranscodeDriver::run`].
pub struct TranscodeDriver {
    settings: DriverSettings,
    prober: Arc<dyn MediaProber>,
}

impl TranscodeDriver {
    pub fn new(settings: DriverSettings, prober: Arc<dyn MediaProber>) -> Self {
        Self { settings, prober }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Runs the job to a terminal outcome.
    ///
    /// Progress and the verifying transition go out on `updates`; a message
    /// on `cancel` kills the encoder. Dropping the cancel sender without
    /// sending does not cancel.
    pub async fn run(
        &self,
        job: Job,
        updates: mpsc::UnboundedSender<DriverUpdate>,
        cancel: oneshot::Receiver<()>,
    ) -> EncodingResult {
        let final_path = job.final_path().to_path_buf();

        let mut log = match JobLog::open(&self.settings.log_dir, &job.id) {
            Ok(log) => log,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "cannot open job log");
                return EncodingResult::failed(
                    FailureKind::Encode,
                    &final_path,
                    format!("cannot open job log: {}", e),
                );
            }
        };

        let result = self.run_logged(&job, &final_path, &mut log, updates, cancel).await;
        match &result.error {
            Some(error) => log.append(&format!("failed: {}", error)),
            None => log.append(&format!(
                "completed: {} ({:.2} MB -> {:.2} MB, {:.1}% smaller)",
                result.output_path.display(),
                result.initial_size_mb,
                result.final_size_mb,
                result.reduction_percent
            )),
        }
        result
    }

    async fn run_logged(
        &self,
        job: &Job,
        final_path: &Path,
        log: &mut JobLog,
        updates: mpsc::UnboundedSender<DriverUpdate>,
        mut cancel: oneshot::Receiver<()>,
    ) -> EncodingResult {
        let temp_path = temp_output_path(final_path);
        let encode_failure =
            |detail: &dyn fmt::Display| EncodingResult::failed(FailureKind::Encode, final_path, detail);

        let initial_bytes = match std::fs::metadata(&job.input_path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                let err = EncodeError::InputMissing(job.input_path.display().to_string());
                return encode_failure(&err);
            }
        };

        let info = match self.probe(&job.input_path).await {
            Ok(info) => info,
            Err(detail) => return encode_failure(&detail),
        };
        let mut estimator = ProgressEstimator::new(
            job.id.clone(),
            Instant::now(),
            info.duration_secs,
            info.fps,
            self.settings.watchdog,
        );
        match (info.duration_secs, info.fps) {
            (None, None) => log.append("probe: no duration or frame rate, progress degraded"),
            (duration, fps) => log.append(&format!(
                "probe: duration={:?}s fps={:?} frames={:?}",
                duration,
                fps,
                estimator.total_frames()
            )),
        }
        let mut parser = ProgressParser::new(estimator.duration_secs());
        let _ = updates.send(DriverUpdate::Progress(estimator.seed()));

        let args = build_ffmpeg_args(job, &temp_path);
        log.append(&format!("start: {}", display_command(&self.settings.ffmpeg_bin, &args)));
        info!(job_id = %job.id, input = %job.input_path.display(), "starting encoder");

        let mut child = match build_ffmpeg_command(&self.settings.ffmpeg_bin, &args).spawn() {
            Ok(child) => child,
            Err(e) => {
                self.remove_temp(&temp_path).await;
                return encode_failure(&EncodeError::Spawn(e));
            }
        };

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, line_tx.clone(), OutputLine::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, line_tx.clone(), OutputLine::Stderr);
        }
        drop(line_tx);

        let watchdog = self.settings.watchdog;
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + watchdog.grace, watchdog.interval);
        let mut watchdog_on = true;
        let mut cancel_armed = true;
        let mut lines_open = true;
        let mut stderr_tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

        let waited = loop {
            tokio::select! {
                line = line_rx.recv(), if lines_open => match line {
                    Some(line) => self.handle_line(
                        line, &mut parser, &mut estimator, &updates, log, &mut stderr_tail,
                    ),
                    None => lines_open = false,
                },
                _ = ticker.tick(), if watchdog_on => {
                    let now = Instant::now();
                    match estimator.liveness_tick(now) {
                        Some(sample) => {
                            debug!(job_id = %job.id, percent = sample.percent, "liveness tick");
                            let _ = updates.send(DriverUpdate::Progress(sample));
                        }
                        None => watchdog_on = estimator.watchdog_active(now),
                    }
                },
                signal = &mut cancel, if cancel_armed => match signal {
                    Ok(()) => {
                        info!(job_id = %job.id, "cancelling encoder");
                        log.append(&format!(
                            "cancel: killing encoder at {:.1}%",
                            estimator.last_percent()
                        ));
                        let _ = child.kill().await;
                        self.remove_temp(&temp_path).await;
                        return EncodingResult::failed(
                            FailureKind::Cancelled,
                            final_path,
                            "job removed while processing",
                        );
                    }
                    Err(_) => cancel_armed = false,
                },
                status = child.wait() => break status,
            }
        };

        while let Some(line) = line_rx.recv().await {
            self.handle_line(line, &mut parser, &mut estimator, &updates, log, &mut stderr_tail);
        }

        let status: ExitStatus = match waited {
            Ok(status) => status,
            Err(e) => {
                self.remove_temp(&temp_path).await;
                return encode_failure(&EncodeError::Io(e));
            }
        };
        log.append(&format!("exit: {}", status));

        if !status.success() {
            self.remove_temp(&temp_path).await;
            let stderr_tail = stderr_tail.into_iter().collect::<Vec<_>>().join(" | ");
            let err = match status.code() {
                Some(code) => EncodeError::Exited { code, stderr_tail },
                None => EncodeError::Terminated { stderr_tail },
            };
            warn!(job_id = %job.id, error = %err, "encoder failed");
            return encode_failure(&err);
        }

        let _ = updates.send(DriverUpdate::Progress(estimator.finish()));
        let _ = updates.send(DriverUpdate::Verifying);
        log.append(&format!(
            "finalize: {} -> {}",
            temp_path.display(),
            final_path.display()
        ));

        let policy = self.settings.retry;
        let (temp, target, input) = (
            temp_path.clone(),
            final_path.to_path_buf(),
            job.input_path.clone(),
        );
        let overwrite = job.overwrite_input;
        let finalized = tokio::task::spawn_blocking(move || {
            try_finalize(&temp, &target, overwrite, &input, &policy)
        })
        .await;

        let committed = match finalized {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "finalization failed");
                return EncodingResult::failed(FailureKind::Finalize, final_path, e);
            }
            Err(join) => {
                self.remove_temp(&temp_path).await;
                return EncodingResult::failed(
                    FailureKind::Finalize,
                    final_path,
                    format!("finalize task failed: {}", join),
                );
            }
        };

        let final_bytes = std::fs::metadata(&committed).map(|m| m.len()).unwrap_or(0);
        info!(job_id = %job.id, output = %committed.display(), "job finished");
        EncodingResult {
            success: true,
            output_path: committed,
            initial_size_mb: bytes_to_mb(initial_bytes),
            final_size_mb: bytes_to_mb(final_bytes),
            reduction_percent: reduction_percent(initial_bytes, final_bytes),
            error: None,
            failure: None,
        }
    }

    /// Probes off the runtime. A probe error degrades progress; a panicked
    /// probe task fails the run.
    async fn probe(&self, input: &Path) -> Result<MediaInfo, String> {
        let prober = Arc::clone(&self.prober);
        let input = input.to_path_buf();
        match tokio::task::spawn_blocking(move || prober.probe(&input)).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(e)) => {
                warn!(error = %e, "probe failed, continuing without media info");
                Ok(MediaInfo::default())
            }
            Err(join) => Err(format!("probe task failed: {}", join)),
        }
    }

    fn handle_line(
        &self,
        line: OutputLine,
        parser: &mut ProgressParser,
        estimator: &mut ProgressEstimator,
        updates: &mpsc::UnboundedSender<DriverUpdate>,
        log: &mut JobLog,
        stderr_tail: &mut VecDeque<String>,
    ) {
        match line {
            OutputLine::Stdout(line) => {
                if let Some(raw) = parser.feed(&line) {
                    let sample = estimator.observe(raw, Instant::now());
                    let _ = updates.send(DriverUpdate::Progress(sample));
                }
            }
            OutputLine::Stderr(line) => {
                if line.trim().is_empty() {
                    return;
                }
                log.append(&format!("stderr: {}", line));
                if stderr_tail.len() == STDERR_TAIL_LINES {
                    stderr_tail.pop_front();
                }
                stderr_tail.push_back(line);
            }
        }
    }

    async fn remove_temp(&self, temp_path: &Path) {
        let policy = self.settings.retry;
        let temp = temp_path.to_path_buf();
        let removed =
            tokio::task::spawn_blocking(move || remove_with_retry(&temp, &policy)).await;
        if !matches!(removed, Ok(Ok(()))) {
            warn!(temp = %temp_path.display(), "could not remove temporary output");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use crate::progress::LIVENESS_CAP;
    use crate::test_support::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(dir: &Path, ffmpeg_bin: PathBuf) -> DriverSettings {
        DriverSettings {
            ffmpeg_bin,
            log_dir: dir.join("logs"),
            watchdog: WatchdogSettings {
                grace: Duration::from_millis(50),
                interval: Duration::from_millis(50),
                max: Duration::from_secs(60),
            },
            retry: RetryPolicy::immediate(2),
        }
    }

    fn driver(dir: &Path, ffmpeg_bin: PathBuf) -> TranscodeDriver {
        let info = MediaInfo {
            duration_secs: Some(10.0),
            fps: Some(30.0),
            streams: vec![],
        };
        TranscodeDriver::new(settings(dir, ffmpeg_bin), Arc::new(StaticProber(info)))
    }

    fn make_job(dir: &Path, overwrite: bool) -> Job {
        let input = dir.join("film.mkv");
        fs::write(&input, b"original content").unwrap();
        Job::new(
            JobSpec {
                input_path: input,
                output_path: if overwrite {
                    PathBuf::new()
                } else {
                    dir.join("film.av1.mkv")
                },
                overwrite_input: overwrite,
                ..JobSpec::default()
            },
            0,
        )
    }

    async fn run(
        driver: &TranscodeDriver,
        job: Job,
    ) -> (EncodingResult, Vec<DriverUpdate>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let result = driver.run(job, tx, cancel_rx).await;
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        (result, updates)
    }

    fn percents(updates: &[DriverUpdate]) -> Vec<f64> {
        updates
            .iter()
            .filter_map(|u| match u {
                DriverUpdate::Progress(s) => Some(s.percent),
                DriverUpdate::Verifying => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_run_commits_output() {
        let temp_dir = TempDir::new().unwrap();
        let driver = driver(temp_dir.path(), successful_encoder(temp_dir.path()));
        let job = make_job(temp_dir.path(), false);
        let output = job.output_path.clone();

        let (result, updates) = run(&driver, job.clone()).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output_path, output);
        assert_eq!(fs::read(&output).unwrap(), b"encoded");
        assert!(!temp_output_path(&output).exists());
        assert!(result.reduction_percent > 0.0);
        assert!(result.job_result().is_some());

        let percents = percents(&updates);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        // frame 150 of 300 estimated frames
        assert!(percents.contains(&50.0));
        assert_eq!(percents.last(), Some(&100.0));
        assert_eq!(updates.last(), Some(&DriverUpdate::Verifying));

        let log = crate::job_log::read_job_log(&temp_dir.path().join("logs"), &job.id).unwrap();
        assert!(log.contains("start: "));
        assert!(log.contains("completed: "));
    }

    #[tokio::test]
    async fn test_overwrite_run_replaces_input() {
        let temp_dir = TempDir::new().unwrap();
        let driver = driver(temp_dir.path(), successful_encoder(temp_dir.path()));
        let job = make_job(temp_dir.path(), true);
        let input = job.input_path.clone();

        let (result, _) = run(&driver, job).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(fs::read(&input).unwrap(), b"encoded");
        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".orig.") || n.contains("_tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test]
    async fn test_nonzero_exit_removes_temp() {
        let temp_dir = TempDir::new().unwrap();
        let driver = driver(temp_dir.path(), failing_encoder(temp_dir.path()));
        let job = make_job(temp_dir.path(), false);
        let output = job.output_path.clone();

        let (result, updates) = run(&driver, job).await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Encode));
        let error = result.error.unwrap();
        assert!(error.starts_with("encode: "));
        assert!(error.contains("code 3"));
        assert!(error.contains("Conversion failed!"));
        assert!(!temp_output_path(&output).exists());
        assert!(!output.exists());
        assert!(!updates.contains(&DriverUpdate::Verifying));
    }

    #[tokio::test]
    async fn test_missing_input_fails_without_spawning() {
        let temp_dir = TempDir::new().unwrap();
        let driver = driver(temp_dir.path(), successful_encoder(temp_dir.path()));
        let job = make_job(temp_dir.path(), false);
        fs::remove_file(&job.input_path).unwrap();

        let (result, updates) = run(&driver, job).await;

        assert_eq!(result.failure, Some(FailureKind::Encode));
        assert!(result.error.unwrap().contains("input file not found"));
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let temp_dir = TempDir::new().unwrap();
        let driver = driver(temp_dir.path(), temp_dir.path().join("no-such-ffmpeg"));
        let job = make_job(temp_dir.path(), false);

        let (result, _) = run(&driver, job).await;

        assert_eq!(result.failure, Some(FailureKind::Encode));
        assert!(result.error.unwrap().contains("failed to start ffmpeg"));
    }

    #[tokio::test]
    async fn test_probe_failure_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let driver = TranscodeDriver::new(
            settings(temp_dir.path(), successful_encoder(temp_dir.path())),
            Arc::new(FailingProber),
        );
        let job = make_job(temp_dir.path(), false);

        let (result, _) = run(&driver, job).await;
        assert!(result.success, "{:?}", result.error);
    }

    #[tokio::test]
    async fn test_cancel_kills_encoder() {
        let temp_dir = TempDir::new().unwrap();
        let driver = driver(temp_dir.path(), hanging_encoder(temp_dir.path()));
        let job = make_job(temp_dir.path(), false);
        let temp = temp_output_path(&job.output_path);

        let (tx, _rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(async move { driver.run(job, tx, cancel_rx).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_watchdog_ticks_for_silent_encoder() {
        let temp_dir = TempDir::new().unwrap();
        let encoder = write_encoder_script(
            temp_dir.path(),
            "fake-ffmpeg-silent",
            r#"sleep 1
printf 'encoded' > "$out"
exit 0"#,
        );
        let driver = driver(temp_dir.path(), encoder);
        let job = make_job(temp_dir.path(), false);

        let (result, updates) = run(&driver, job).await;

        assert!(result.success, "{:?}", result.error);
        let ticks: Vec<f64> = updates
            .iter()
            .filter_map(|u| match u {
                DriverUpdate::Progress(s)
                    if s.status_text.as_deref() == Some("waiting for encoder output") =>
                {
                    Some(s.percent)
                }
                _ => None,
            })
            .collect();
        assert!(!ticks.is_empty());
        assert!(ticks.iter().all(|p| *p <= LIVENESS_CAP));
    }

    #[tokio::test]
    async fn test_non_utf8_stderr_does_not_break_encode() {
        let temp_dir = TempDir::new().unwrap();
        let encoder = write_encoder_script(
            temp_dir.path(),
            "fake-ffmpeg-latin1",
            r#"printf 'title=Caf\351\n' >&2
sleep 0.3
i=0
while [ $i -lt 50 ]; do echo "stream line $i" >&2; i=$((i+1)); done
printf 'encoded' > "$out"
exit 0"#,
        );
        let driver = driver(temp_dir.path(), encoder);
        let job = make_job(temp_dir.path(), false);

        let (result, _) = run(&driver, job.clone()).await;

        assert!(result.success, "{:?}", result.error);
        let log = crate::job_log::read_job_log(&temp_dir.path().join("logs"), &job.id).unwrap();
        assert!(log.contains("title=Caf\u{FFFD}"));
        assert!(log.contains("stream line 49"));
    }

    #[test]
    fn test_reduction_percent() {
        assert_eq!(reduction_percent(200, 50), 75.0);
        assert_eq!(reduction_percent(0, 50), 0.0);
    }
}
