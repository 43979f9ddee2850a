//! Per-job log artifact.
//!
//! Every lifecycle event of a job is appended to `<log_dir>/<job_id>.log`
//! as `[<RFC 3339 timestamp>] <message>`.

use chrono::{SecondsFormat, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Path of a job's log file.
pub fn log_path(log_dir: &Path, job_id: &str) -> PathBuf {
    log_dir.join(format!("{}.log", job_id))
}

/// Append-only writer for one job's log.
#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    file: File,
}

impl JobLog {
    /// Opens (creating if needed) the log for `job_id`.
    pub fn open(log_dir: &Path, job_id: &str) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_path(log_dir, job_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one timestamped line. Write errors are dropped; the log is
    /// diagnostic and must not fail the job.
    pub fn append(&mut self, message: &str) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        for line in message.lines() {
            let _ = writeln!(self.file, "[{}] {}", stamp, line);
        }
    }
}

/// Reads a job's log. A job that never ran has no log and yields `NotFound`.
pub fn read_job_log(log_dir: &Path, job_id: &str) -> io::Result<String> {
    fs::read_to_string(log_path(log_dir, job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let log_dir = temp_dir.path().join("logs");

        let mut log = JobLog::open(&log_dir, "job-1").unwrap();
        log.append("start: ffmpeg -i in.mkv");
        log.append("exit: code 0");
        assert_eq!(log.path(), log_path(&log_dir, "job-1"));

        let content = read_job_log(&log_dir, "job-1").unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] start: ffmpeg -i in.mkv"));
        assert!(lines[1].ends_with("] exit: code 0"));

        let stamp = &lines[0][1..lines[0].find(']').unwrap()];
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn test_reopen_appends() {
        let temp_dir = TempDir::new().unwrap();
        JobLog::open(temp_dir.path(), "job-2").unwrap().append("first");
        JobLog::open(temp_dir.path(), "job-2").unwrap().append("second");

        let content = read_job_log(temp_dir.path(), "job-2").unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_multiline_message_split() {
        let temp_dir = TempDir::new().unwrap();
        JobLog::open(temp_dir.path(), "job-3")
            .unwrap()
            .append("error: encode failed\nlast stderr line");

        let content = read_job_log(temp_dir.path(), "job-3").unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_missing_log() {
        let temp_dir = TempDir::new().unwrap();
        let err = read_job_log(temp_dir.path(), "nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
