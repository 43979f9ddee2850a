//! Finalization of a completed encode.
//!
//! Commits the encoder's temporary output into its final location. When the
//! input is being overwritten the original is first moved to a timestamped
//! backup, which is restored if the commit fails and deleted once it succeeds.

use crate::retry::RetryPolicy;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur while committing an output.
#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The encoder never produced the temporary file.
    #[error("temporary output {0} does not exist")]
    MissingTemp(PathBuf),

    /// Moving the temporary file into place failed after all retries.
    #[error("failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The committed file does not have the temporary file's size.
    #[error("size mismatch after move: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Result of [`finalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeOutcome {
    pub success: bool,
    pub final_path: PathBuf,
    pub error: Option<String>,
}

/// Sibling path the encoder writes to: `<base>_tmp<ext>`.
pub fn temp_output_path(final_path: &Path) -> PathBuf {
    let stem = final_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match final_path.extension() {
        Some(ext) => format!("{}_tmp.{}", stem, ext.to_string_lossy()),
        None => format!("{}_tmp", stem),
    };
    final_path.with_file_name(name)
}

/// Generates a backup path for the original file.
///
/// The backup path follows the format: `<name>.orig.<timestamp>`
/// where timestamp is Unix epoch seconds.
pub fn backup_path(original: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut backup = original.as_os_str().to_owned();
    backup.push(format!(".orig.{}", timestamp));
    PathBuf::from(backup)
}

/// Sibling of `target` that a copy is staged in before being renamed over it.
fn staging_path(target: &Path) -> PathBuf {
    let mut staged = target.as_os_str().to_owned();
    staged.push(".partial");
    PathBuf::from(staged)
}

/// Rename, falling back to copy + remove when the rename fails
/// (cross-device moves, some network filesystems).
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_into_place(from, to)?;
    if let Err(e) = fs::remove_file(from) {
        warn!(source = %from.display(), error = %e, "copied but could not remove source");
    }
    Ok(())
}

/// Copies `from` next to `to` and renames the copy over `to`, so `to` is
/// either untouched or complete. A failed copy leaves no staging file.
fn copy_into_place(from: &Path, to: &Path) -> io::Result<()> {
    let staged = staging_path(to);
    let result = fs::copy(from, &staged).and_then(|_| fs::rename(&staged, to));
    if result.is_err() {
        let _ = fs::remove_file(&staged);
    }
    result
}

/// Removes a file with retries. A file that is already gone counts as removed.
pub fn remove_with_retry(path: &Path, policy: &RetryPolicy) -> io::Result<()> {
    policy.run("remove file", || match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
}

/// Commits `temp_path` to `final_path`, returning the committed path.
///
/// On error the temp file is gone and, in overwrite mode, the original is
/// back at `original_path`.
pub fn try_finalize(
    temp_path: &Path,
    final_path: &Path,
    is_overwrite: bool,
    original_path: &Path,
    policy: &RetryPolicy,
) -> Result<PathBuf, FinalizeError> {
    let expected = match fs::metadata(temp_path) {
        Ok(meta) => meta.len(),
        Err(_) => return Err(FinalizeError::MissingTemp(temp_path.to_path_buf())),
    };

    let mut backup = None;
    if is_overwrite && original_path.exists() {
        let candidate = backup_path(original_path);
        match policy.run("backup original", || move_file(original_path, &candidate)) {
            Ok(()) => backup = Some(candidate),
            Err(e) => warn!(
                original = %original_path.display(),
                error = %e,
                "could not back up original, committing without a backup"
            ),
        }
    }

    let committed = policy
        .run("move output", || move_file(temp_path, final_path))
        .map_err(|source| FinalizeError::Move {
            from: temp_path.to_path_buf(),
            to: final_path.to_path_buf(),
            source,
        })
        .and_then(|()| {
            let actual = fs::metadata(final_path).map(|m| m.len()).unwrap_or(0);
            if actual == expected {
                Ok(())
            } else {
                Err(FinalizeError::SizeMismatch { expected, actual })
            }
        });

    match committed {
        Ok(()) => {
            if let Some(backup) = &backup {
                if let Err(e) = remove_with_retry(backup, policy) {
                    warn!(backup = %backup.display(), error = %e, "could not delete backup");
                }
            }
            let _ = remove_with_retry(temp_path, policy);
            Ok(final_path.to_path_buf())
        }
        Err(err) => {
            let _ = remove_with_retry(temp_path, policy);
            if let Some(backup) = &backup {
                if let Err(e) = policy.run("restore backup", || move_file(backup, original_path)) {
                    warn!(
                        backup = %backup.display(),
                        error = %e,
                        "could not restore backup, original left at backup path"
                    );
                }
            } else if matches!(err, FinalizeError::SizeMismatch { .. }) && !is_overwrite {
                let _ = remove_with_retry(final_path, policy);
            }
            Err(err)
        }
    }
}

/// Finalization entry point, usable independently of the queue.
pub fn finalize(
    temp_path: &Path,
    final_path: &Path,
    job_id: &str,
    is_overwrite: bool,
    original_path: &Path,
    policy: &RetryPolicy,
) -> FinalizeOutcome {
    match try_finalize(temp_path, final_path, is_overwrite, original_path, policy) {
        Ok(path) => {
            info!(job_id, final_path = %path.display(), "output committed");
            FinalizeOutcome {
                success: true,
                final_path: path,
                error: None,
            }
        }
        Err(e) => {
            warn!(job_id, error = %e, "finalization failed");
            FinalizeOutcome {
                success: false,
                final_path: final_path.to_path_buf(),
                error: Some(e.to_string()),
            }
        }
    }
}
