//! Startup checks
//!
//! Preflight checks run before the daemon accepts jobs:
//! - ffmpeg is runnable and not older than [`MIN_FFMPEG_MAJOR`]
//! - ffprobe is runnable

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Oldest ffmpeg major release with the `-progress` key set the driver parses.
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),
}

/// What the checks found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    /// `None` for builds whose version string carries no release number.
    pub ffmpeg_major: Option<u32>,
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
///
/// Git snapshots ("N-112345-g...") carry no release number and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Runs `<bin> -version` and returns its stdout.
fn version_output(bin: &Path) -> Result<String, String> {
    let output = Command::new(bin)
        .arg("-version")
        .output()
        .map_err(|e| format!("failed to run {} -version: {}", bin.display(), e))?;

    if !output.status.success() {
        return Err(format!(
            "{} -version exited with {}",
            bin.display(),
            output.status
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Checks ffmpeg is runnable and recent enough.
///
/// An unparseable version is accepted with a warning.
pub fn check_ffmpeg(bin: &Path) -> Result<Option<u32>, StartupError> {
    let output = version_output(bin).map_err(StartupError::FfmpegUnavailable)?;
    check_ffmpeg_version_output(&output)
}

fn check_ffmpeg_version_output(output: &str) -> Result<Option<u32>, StartupError> {
    match parse_ffmpeg_version(output) {
        Some(major) if major < MIN_FFMPEG_MAJOR => Err(StartupError::FfmpegVersion(format!(
            "ffmpeg {}.x or newer required, got {}",
            MIN_FFMPEG_MAJOR, major
        ))),
        Some(major) => Ok(Some(major)),
        None => {
            warn!(
                version = output.lines().next().unwrap_or("(empty)"),
                "could not parse ffmpeg version, continuing"
            );
            Ok(None)
        }
    }
}

/// Checks ffprobe is runnable.
pub fn check_ffprobe(bin: &Path) -> Result<(), StartupError> {
    version_output(bin)
        .map(|_| ())
        .map_err(StartupError::FfprobeUnavailable)
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. ffmpeg availability and version
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<StartupReport, StartupError> {
    let ffmpeg_major = check_ffmpeg(&cfg.encoder.ffmpeg_bin)?;
    check_ffprobe(&cfg.encoder.ffprobe_bin)?;
    info!(?ffmpeg_major, "startup checks passed");
    Ok(StartupReport { ffmpeg_major })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );

            let parsed = parse_ffmpeg_version(&version_output);
            prop_assert_eq!(
                parsed, Some(major),
                "Should parse major version {} from '{}'",
                major, version_output
            );
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );

            let parsed = parse_ffmpeg_version(&version_output);
            prop_assert_eq!(parsed, Some(major));
        }

        // Versions below the minimum are rejected, everything else passes.
        #[test]
        fn prop_minimum_version_enforced(major in 1u32..20) {
            let output = format!("ffmpeg version {}.0 Copyright", major);
            let result = check_ffmpeg_version_output(&output);
            prop_assert_eq!(result.is_ok(), major >= MIN_FFMPEG_MAJOR);
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_multiline() {
        let output = "configuration: --enable-gpl\nffmpeg version 7.1 Copyright (c) 2000-2024\nlibavutil 59.";
        assert_eq!(parse_ffmpeg_version(output), Some(7));
    }

    #[test]
    fn test_git_snapshot_version_accepted() {
        let output = "ffmpeg version N-112345-gabcdef0 Copyright (c) 2000-2024";
        assert_eq!(parse_ffmpeg_version(output), None);
        assert_eq!(check_ffmpeg_version_output(output).unwrap(), None);
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version(""), None);
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
    }

    #[test]
    fn test_missing_binaries() {
        let missing = Path::new("/nonexistent/ffmpeg");
        assert!(matches!(
            check_ffmpeg(missing),
            Err(StartupError::FfmpegUnavailable(_))
        ));
        assert!(matches!(
            check_ffprobe(missing),
            Err(StartupError::FfprobeUnavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_scripted_ffmpeg_version() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let bin = crate::test_support::write_encoder_script(
            temp_dir.path(),
            "ffmpeg",
            "echo 'ffmpeg version 6.1.1 Copyright (c) 2000-2023 the FFmpeg developers'",
        );
        assert_eq!(check_ffmpeg(&bin).unwrap(), Some(6));
        assert!(check_ffprobe(&bin).is_ok());
    }
}
