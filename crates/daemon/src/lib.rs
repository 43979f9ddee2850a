//! Transcode queue daemon
//!
//! Background service that keeps a persistent priority queue of ffmpeg
//! transcode jobs, drives each encode with progress estimation and a liveness
//! watchdog, and finalizes outputs atomically.

pub mod concurrency;
pub mod daemon;
pub mod driver;
pub mod encode;
pub mod finalize;
pub mod job;
pub mod job_log;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod startup;
pub mod status_server;
pub mod store;

#[cfg(all(test, unix))]
mod test_support;

pub use transcode_queue_config as config;
pub use transcode_queue_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan, PlanSource};
pub use daemon::{Daemon, DaemonError};
pub use driver::{
    DriverSettings, DriverUpdate, EncodingResult, FailureKind, TranscodeDriver,
};
pub use encode::{build_ffmpeg_args, build_ffmpeg_command, EncodeError, ProgressParser};
pub use finalize::{finalize, temp_output_path, FinalizeError, FinalizeOutcome};
pub use job::{
    EncodeOptions, HwAccel, Job, JobError, JobResult, JobSpec, JobStatus, Resolution,
    TrackSelection,
};
pub use probe::{FfprobeProber, MediaInfo, MediaProber, ProbeError};
pub use progress::{ProgressEstimator, ProgressSample, RawProgress, WatchdogSettings};
pub use queue::{QueueError, QueueEvent, QueueManager, QueueSettings, QueueSnapshot};
pub use retry::RetryPolicy;
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError, StartupReport};
pub use status_server::{create_router, run_status_server, ServerError};
pub use store::{JobStore, StoreDocument, StoreError, StoredQueueConfig};
