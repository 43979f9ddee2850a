//! Job store for persisting the queue across restarts.
//!
//! All jobs and the queue configuration live in a single JSON document.
//! Writes go to a sibling temp file which is then renamed over the store,
//! so a crash mid-write leaves the previous document intact.

use crate::finalize::temp_output_path;
use crate::job::{current_timestamp_ms, Job, JobStatus};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error attached to jobs found in flight when the store is loaded.
pub const INTERRUPTED_ERROR: &str = "interrupted by restart";

/// Errors from reading or writing the store document.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("store document at {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Queue configuration persisted alongside the jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredQueueConfig {
    /// Admission slots. Zero means "not set yet".
    #[serde(default)]
    pub max_parallel_jobs: u32,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

fn default_auto_start() -> bool {
    true
}

impl Default for StoredQueueConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 0,
            auto_start: default_auto_start(),
        }
    }
}

/// The persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub config: StoredQueueConfig,
    /// Unix timestamp (milliseconds) of the last write.
    #[serde(default)]
    pub saved_at: i64,
}

/// Reads and writes the store document at a fixed path.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the document. A missing file yields an empty document.
    pub fn load(&self) -> Result<StoreDocument, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(StoreDocument::default())
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes the document atomically, stamping `saved_at`.
    pub fn save(&self, jobs: &[Job], config: StoredQueueConfig) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct DocumentRef<'a> {
            jobs: &'a [Job],
            config: StoredQueueConfig,
            saved_at: i64,
        }

        let json = serde_json::to_string_pretty(&DocumentRef {
            jobs,
            config,
            saved_at: current_timestamp_ms(),
        })
        .map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.tmp_path();
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Fails every job that was processing or verifying when the daemon stopped.
///
/// Returns the `_tmp` outputs those jobs may have left behind; the caller
/// deletes them. Interrupted jobs are never re-queued.
pub fn recover_interrupted(jobs: &mut [Job]) -> Vec<PathBuf> {
    let mut leftovers = Vec::new();
    for job in jobs.iter_mut().filter(|j| j.status.is_in_flight()) {
        job.status = JobStatus::Failed;
        job.error = Some(INTERRUPTED_ERROR.to_string());
        job.processing_end_time = Some(current_timestamp_ms());
        leftovers.push(temp_output_path(job.final_path()));
    }
    leftovers
}
