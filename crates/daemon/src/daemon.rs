//! Daemon startup and main loop
//!
//! Wires configuration, startup checks, the queue and the status server
//! together and runs until shutdown.

use crate::config::{Config, ConfigError};
use crate::driver::{DriverSettings, TranscodeDriver};
use crate::probe::FfprobeProber;
use crate::queue::{QueueError, QueueEvent, QueueManager, QueueSettings};
use crate::startup::{run_startup_checks, StartupError};
use crate::status_server::run_status_server;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Queue could not be opened or flushed
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    pub queue: QueueManager,
}

impl Daemon {
    /// Initialize the daemon from a config file
    ///
    /// 1. Load config from file and apply environment overrides
    /// 2. Run startup checks (ffmpeg, ffprobe)
    /// 3. Open the queue, recovering jobs interrupted by a previous run
    ///
    /// Must be called from within a tokio runtime.
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::new(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when ffmpeg is not available.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let prober = Arc::new(FfprobeProber::new(config.encoder.ffprobe_bin.clone()));
        let driver = TranscodeDriver::new(DriverSettings::from_config(&config), prober);
        let queue = QueueManager::open(QueueSettings::from_config(&config), driver)?;
        Ok(Self { config, queue })
    }

    /// Start the status HTTP server
    ///
    /// Spawns the HTTP server as a background task.
    pub fn start_status_server(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let addr = self.config.server.addr.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(queue, &addr).await {
                error!(error = %e, "status server stopped");
            }
        })
    }

    /// Start the event logger
    ///
    /// Mirrors queue events into the tracing output.
    pub fn start_event_logger(&self) -> tokio::task::JoinHandle<()> {
        let mut events = self.queue.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event logger fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Run until ctrl-c
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }

    /// Run the daemon with all background tasks until `shutdown` resolves
    ///
    /// Pending progress is flushed to the store before returning. Encoders
    /// still running are left to the next start, which fails them as
    /// interrupted.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        let server = self.config.server.enabled.then(|| self.start_status_server());
        let logger = self.start_event_logger();

        let snapshot = self.queue.snapshot();
        info!(
            jobs = snapshot.jobs.len(),
            max_parallel_jobs = snapshot.max_parallel_jobs,
            running = snapshot.running,
            "daemon started"
        );

        shutdown.await;
        info!("shutting down");

        if let Some(server) = server {
            server.abort();
        }
        logger.abort();
        self.queue.flush()?;
        Ok(())
    }
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::JobAdded { job } => {
            debug!(job_id = %job.id, "event: job added");
        }
        QueueEvent::JobStarted { job_id } => info!(job_id, "job started"),
        QueueEvent::JobProgress { sample } => {
            debug!(
                job_id = %sample.job_id,
                percent = sample.percent,
                fps = ?sample.fps,
                "progress"
            );
        }
        QueueEvent::JobCompleted { job } => {
            let reduction = job.result.as_ref().map(|r| r.reduction_percent);
            info!(job_id = %job.id, ?reduction, "job completed");
        }
        QueueEvent::JobFailed {
            job_id,
            error,
            log_path,
        } => {
            warn!(job_id, error, log = ?log_path, "job failed");
        }
        QueueEvent::JobCancelled { job_id } => info!(job_id, "job cancelled"),
        QueueEvent::JobRemoved { job_id } => info!(job_id, "job removed"),
        QueueEvent::QueueStarted => debug!("event: queue started"),
        QueueEvent::QueuePaused => debug!("event: queue paused"),
    }
}
