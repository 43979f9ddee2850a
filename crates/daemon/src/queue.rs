//! Queue manager
//!
//! Owns every job, decides which queued jobs run next, applies driver updates
//! and persists the whole document through the [`JobStore`]. All job state
//! lives behind one mutex that is never held across an await; each admitted
//! job runs as its own tokio task awaiting [`TranscodeDriver::run`].

use crate::concurrency::derive_plan;
use crate::driver::{DriverUpdate, EncodingResult, TranscodeDriver};
use crate::finalize::remove_with_retry;
use crate::job::{Job, JobError, JobSpec, JobStatus};
use crate::job_log::{log_path, read_job_log};
use crate::progress::ProgressSample;
use crate::store::{recover_interrupted, JobStore, StoreError, StoredQueueConfig};
use crate::Config;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Capacity of the event channel; slow subscribers miss older events.
const EVENT_CAPACITY: usize = 256;

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job spec is incomplete; no job was created.
    #[error(transparent)]
    Job(#[from] JobError),

    /// The input file does not exist; no job was created.
    #[error("input file not found: {0}")]
    InputMissing(PathBuf),

    #[error("job not found: {0}")]
    NotFound(String),

    /// The job is committing its output and cannot be removed until it ends.
    #[error("job {0} is finalizing its output")]
    Finalizing(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to read log for job {id}: {source}")]
    Log {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Observable queue events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueueEvent {
    JobAdded { job: Job },
    #[serde(rename_all = "camelCase")]
    JobStarted { job_id: String },
    JobProgress { sample: ProgressSample },
    JobCompleted { job: Job },
    #[serde(rename_all = "camelCase")]
    JobFailed {
        job_id: String,
        error: String,
        log_path: Option<PathBuf>,
    },
    #[serde(rename_all = "camelCase")]
    JobCancelled { job_id: String },
    #[serde(rename_all = "camelCase")]
    JobRemoved { job_id: String },
    QueueStarted,
    QueuePaused,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub running: bool,
    pub max_parallel_jobs: u32,
    pub auto_start: bool,
    pub in_flight: usize,
    pub jobs: Vec<Job>,
}

/// Settings the queue needs from the configuration.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub state_file: PathBuf,
    /// Zero defers to the stored value or the derived default.
    pub max_parallel_jobs: u32,
    /// Initial `autoStart` for a store that has never been written.
    pub auto_start: bool,
    pub progress_persist_interval: Duration,
}

impl QueueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            state_file: config.paths.state_file.clone(),
            max_parallel_jobs: config.queue.max_parallel_jobs,
            auto_start: config.queue.auto_start,
            progress_persist_interval: Duration::from_millis(
                config.queue.progress_persist_interval_ms,
            ),
        }
    }
}

struct QueueState {
    jobs: Vec<Job>,
    config: StoredQueueConfig,
    running: bool,
    /// Jobs holding an admission slot. The cancel sender is taken when the
    /// job is removed; the slot is released when its task finishes.
    in_flight: HashMap<String, Option<oneshot::Sender<()>>>,
    flush_pending: bool,
}

impl QueueState {
    fn find_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }
}

struct Inner {
    state: Mutex<QueueState>,
    store: JobStore,
    driver: TranscodeDriver,
    events: broadcast::Sender<QueueEvent>,
    progress_persist_interval: Duration,
}

/// Handle to the queue. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    /// Loads the store, fails interrupted jobs and runs a first admission pass.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(settings: QueueSettings, driver: TranscodeDriver) -> Result<Self, QueueError> {
        let store = JobStore::new(&settings.state_file);
        let mut doc = store.load()?;

        let leftovers = recover_interrupted(&mut doc.jobs);
        let retry = driver.settings().retry;
        for temp in &leftovers {
            if let Err(e) = remove_with_retry(temp, &retry) {
                warn!(temp = %temp.display(), error = %e, "could not remove leftover output");
            }
        }
        if !leftovers.is_empty() {
            info!(count = leftovers.len(), "failed jobs interrupted by restart");
        }

        let fresh = doc.saved_at == 0;
        if fresh {
            doc.config.auto_start = settings.auto_start;
        }
        let plan = derive_plan(settings.max_parallel_jobs, doc.config.max_parallel_jobs);
        doc.config.max_parallel_jobs = plan.max_parallel_jobs;
        info!(
            max_parallel_jobs = plan.max_parallel_jobs,
            source = ?plan.source,
            jobs = doc.jobs.len(),
            "queue loaded"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let queue = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    jobs: doc.jobs,
                    config: doc.config,
                    running: doc.config.auto_start,
                    in_flight: HashMap::new(),
                    flush_pending: false,
                }),
                store,
                driver,
                events,
                progress_persist_interval: settings.progress_persist_interval,
            }),
        };

        if fresh || !leftovers.is_empty() {
            let state = queue.state();
            queue.persist(&state);
        }
        queue.admit();
        Ok(queue)
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes the full document.
    fn persist(&self, state: &QueueState) {
        if let Err(e) = self.inner.store.save(&state.jobs, state.config) {
            error!(error = %e, "failed to persist job store");
        }
    }

    /// Persists and cancels any pending progress flush.
    fn persist_now(&self, state: &mut QueueState) {
        state.flush_pending = false;
        self.persist(state);
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Validates and enqueues a job, then runs an admission pass.
    pub fn add_job(&self, spec: JobSpec, priority: i32) -> Result<Job, QueueError> {
        spec.validate()?;
        if !spec.input_path.exists() {
            return Err(QueueError::InputMissing(spec.input_path));
        }

        let job = Job::new(spec, priority);
        {
            let mut state = self.state();
            state.jobs.push(job.clone());
            self.persist_now(&mut state);
        }
        info!(job_id = %job.id, input = %job.input_path.display(), priority, "job added");
        self.emit(QueueEvent::JobAdded { job: job.clone() });
        self.admit();
        Ok(job)
    }

    /// Removes a job. A running encoder is killed.
    ///
    /// A job in `verifying` is refused: its output is already being
    /// committed and cannot be stopped.
    pub fn remove_job(&self, id: &str) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            let Some(index) = state.jobs.iter().position(|j| j.id == id) else {
                return Err(QueueError::NotFound(id.to_string()));
            };
            if state.jobs[index].status == JobStatus::Verifying {
                return Err(QueueError::Finalizing(id.to_string()));
            }
            let job = state.jobs.remove(index);
            if let Some(cancel) = state.in_flight.get_mut(id).and_then(Option::take) {
                info!(job_id = id, status = %job.status, "stopping encoder of removed job");
                let _ = cancel.send(());
            }
            self.persist_now(&mut state);
        }
        self.emit(QueueEvent::JobRemoved {
            job_id: id.to_string(),
        });
        self.admit();
        Ok(())
    }

    /// Withdraws a queued job, keeping it in history as cancelled.
    pub fn cancel_job(&self, id: &str) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            let job = state
                .find_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            job.transition(JobStatus::Cancelled)?;
            self.persist_now(&mut state);
        }
        self.emit(QueueEvent::JobCancelled {
            job_id: id.to_string(),
        });
        Ok(())
    }

    /// Lets admission passes promote queued jobs.
    pub fn start_processing(&self) {
        self.state().running = true;
        info!("queue started");
        self.emit(QueueEvent::QueueStarted);
        self.admit();
    }

    /// Stops promoting queued jobs. Jobs already in flight keep running.
    pub fn pause_processing(&self) {
        self.state().running = false;
        info!("queue paused");
        self.emit(QueueEvent::QueuePaused);
    }

    pub fn set_max_parallel_jobs(&self, max: u32) {
        {
            let mut state = self.state();
            state.config.max_parallel_jobs = max.max(1);
            self.persist_now(&mut state);
        }
        self.admit();
    }

    pub fn set_auto_start(&self, auto_start: bool) {
        let mut state = self.state();
        state.config.auto_start = auto_start;
        self.persist_now(&mut state);
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state();
        QueueSnapshot {
            running: state.running,
            max_parallel_jobs: state.config.max_parallel_jobs,
            auto_start: state.config.auto_start,
            in_flight: state.in_flight.len(),
            jobs: state.jobs.clone(),
        }
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.state().jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state().jobs.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Contents of a job's log artifact.
    pub fn job_log(&self, id: &str) -> Result<String, QueueError> {
        if self.job(id).is_none() {
            return Err(QueueError::NotFound(id.to_string()));
        }
        read_job_log(&self.inner.driver.settings().log_dir, id).map_err(|source| QueueError::Log {
            id: id.to_string(),
            source,
        })
    }

    /// Writes any coalesced progress immediately.
    pub fn flush(&self) -> Result<(), QueueError> {
        let mut state = self.state();
        state.flush_pending = false;
        self.inner.store.save(&state.jobs, state.config)?;
        Ok(())
    }

    /// Admission pass: fills free slots with queued jobs by
    /// (priority desc, added_at asc, insertion order).
    ///
    /// Safe to call at any time; a pass with no free slot admits nothing.
    pub(crate) fn admit(&self) {
        let mut started = Vec::new();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            if !state.running {
                return;
            }

            let max = state.config.max_parallel_jobs.max(1) as usize;
            let free = max.saturating_sub(state.in_flight.len());
            if free == 0 {
                return;
            }

            let mut candidates: Vec<usize> = state
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, j)| j.status == JobStatus::Queued)
                .map(|(i, _)| i)
                .collect();
            candidates.sort_by(|&a, &b| {
                let (a, b) = (&state.jobs[a], &state.jobs[b]);
                b.priority
                    .cmp(&a.priority)
                    .then(a.added_at.cmp(&b.added_at))
            });

            let log_dir = &self.inner.driver.settings().log_dir;
            for index in candidates.into_iter().take(free) {
                let job = &mut state.jobs[index];
                if let Err(e) = job.transition(JobStatus::Processing) {
                    warn!(error = %e, "skipping job during admission");
                    continue;
                }
                job.log_path = Some(log_path(log_dir, &job.id));

                let (cancel_tx, cancel_rx) = oneshot::channel();
                state.in_flight.insert(job.id.clone(), Some(cancel_tx));
                started.push((job.clone(), cancel_rx));
            }

            if !started.is_empty() {
                self.persist_now(state);
            }
        }

        for (job, cancel) in started {
            info!(job_id = %job.id, priority = job.priority, "job admitted");
            self.emit(QueueEvent::JobStarted {
                job_id: job.id.clone(),
            });
            self.spawn_job(job, cancel);
        }
    }

    fn spawn_job(&self, job: Job, cancel: oneshot::Receiver<()>) {
        let queue = self.clone();
        tokio::spawn(async move {
            let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
            let forwarder = {
                let queue = queue.clone();
                let id = job.id.clone();
                tokio::spawn(async move {
                    while let Some(update) = updates_rx.recv().await {
                        queue.apply_update(&id, update);
                    }
                })
            };

            let id = job.id.clone();
            let result = queue.inner.driver.run(job, updates_tx, cancel).await;
            // the driver dropped its sender; this drains what is left
            let _ = forwarder.await;

            queue.complete(&id, result);
            queue.admit();
        });
    }

    fn apply_update(&self, id: &str, update: DriverUpdate) {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(job) = state.find_mut(id) else {
            return;
        };

        match update {
            DriverUpdate::Progress(sample) => {
                if job.apply_progress(&sample) {
                    let sample = ProgressSample {
                        percent: job.progress,
                        ..sample
                    };
                    self.emit(QueueEvent::JobProgress { sample });
                    self.schedule_flush(state);
                }
            }
            DriverUpdate::Verifying => match job.transition(JobStatus::Verifying) {
                Ok(()) => {
                    debug!(job_id = id, "verifying output");
                    self.persist_now(state);
                }
                Err(e) => warn!(error = %e, "ignoring verifying update"),
            },
        }
    }

    /// Coalesces progress writes into one persist per interval.
    fn schedule_flush(&self, state: &mut QueueState) {
        if state.flush_pending {
            return;
        }
        state.flush_pending = true;
        let queue = self.clone();
        let interval = self.inner.progress_persist_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let mut state = queue.state();
            if state.flush_pending {
                queue.persist_now(&mut state);
            }
        });
    }

    /// Completion handler: applies the driver's result and frees the slot.
    fn complete(&self, id: &str, result: EncodingResult) {
        let event = {
            let mut guard = self.state();
            let state = &mut *guard;
            state.in_flight.remove(id);

            let Some(job) = state.find_mut(id) else {
                debug!(job_id = id, "removed job finished");
                return;
            };

            let event = match result.job_result() {
                Some(summary) => match job.complete(summary) {
                    Ok(()) => {
                        info!(job_id = id, output = %result.output_path.display(), "job completed");
                        QueueEvent::JobCompleted { job: job.clone() }
                    }
                    Err(e) => {
                        warn!(error = %e, "completion out of order");
                        let message = e.to_string();
                        let _ = job.fail(&message);
                        Self::failed_event(job, message)
                    }
                },
                None => {
                    let message = result
                        .error
                        .unwrap_or_else(|| "encode: unknown failure".to_string());
                    if let Err(e) = job.fail(&message) {
                        warn!(error = %e, "failure out of order");
                    }
                    warn!(job_id = id, error = %message, "job failed");
                    Self::failed_event(job, message)
                }
            };
            self.persist_now(state);
            event
        };
        self.emit(event);
    }

    fn failed_event(job: &Job, error: String) -> QueueEvent {
        QueueEvent::JobFailed {
            job_id: job.id.clone(),
            error,
            log_path: job.log_path.clone(),
        }
    }
}
