//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Queue admission configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum jobs in flight at once (0 = use stored value, else derive from CPU count)
    #[serde(default)]
    pub max_parallel_jobs: u32,
    /// Whether admission starts automatically when the daemon loads
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// Debounce interval for progress-only store writes
    #[serde(default = "default_progress_persist_interval_ms")]
    pub progress_persist_interval_ms: u64,
}

fn default_auto_start() -> bool {
    true
}

fn default_progress_persist_interval_ms() -> u64 {
    2000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 0,
            auto_start: default_auto_start(),
            progress_persist_interval_ms: default_progress_persist_interval_ms(),
        }
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable (ffmpeg-compatible command line)
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,
    /// Prober executable (ffprobe-compatible command line)
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: PathBuf,
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
        }
    }
}

/// Filesystem locations owned by the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Job store document
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Directory holding one log file per job
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/transcode-queue/jobs.json")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/lib/transcode-queue/logs")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            log_dir: default_log_dir(),
        }
    }
}

/// Liveness watchdog timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogConfig {
    /// Silence allowed after start before synthetic ticks begin
    #[serde(default = "default_watchdog_grace_ms")]
    pub grace_ms: u64,
    /// Interval between synthetic ticks
    #[serde(default = "default_watchdog_interval_ms")]
    pub interval_ms: u64,
    /// Watchdog gives up after this long
    #[serde(default = "default_watchdog_max_ms")]
    pub max_ms: u64,
}

fn default_watchdog_grace_ms() -> u64 {
    10_000
}

fn default_watchdog_interval_ms() -> u64 {
    2_000
}

fn default_watchdog_max_ms() -> u64 {
    300_000
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_watchdog_grace_ms(),
            interval_ms: default_watchdog_interval_ms(),
            max_ms: default_watchdog_max_ms(),
        }
    }
}

/// Bounded retry for filesystem operations during finalization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Status HTTP server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_server_enabled() -> bool {
    true
}

fn default_server_addr() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            addr: default_server_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TQ_MAX_PARALLEL_JOBS -> queue.max_parallel_jobs
    /// - TQ_AUTO_START -> queue.auto_start
    /// - TQ_FFMPEG_BIN -> encoder.ffmpeg_bin
    /// - TQ_FFPROBE_BIN -> encoder.ffprobe_bin
    /// - TQ_STATE_FILE -> paths.state_file
    /// - TQ_LOG_DIR -> paths.log_dir
    /// - TQ_SERVER_ADDR -> server.addr
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TQ_MAX_PARALLEL_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.queue.max_parallel_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("TQ_AUTO_START") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.queue.auto_start = true,
                "false" | "0" | "no" => self.queue.auto_start = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("TQ_FFMPEG_BIN") {
            if !val.is_empty() {
                self.encoder.ffmpeg_bin = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TQ_FFPROBE_BIN") {
            if !val.is_empty() {
                self.encoder.ffprobe_bin = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TQ_STATE_FILE") {
            if !val.is_empty() {
                self.paths.state_file = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TQ_LOG_DIR") {
            if !val.is_empty() {
                self.paths.log_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TQ_SERVER_ADDR") {
            if !val.is_empty() {
                self.server.addr = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields defaults plus overrides
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("TQ_MAX_PARALLEL_JOBS");
        env::remove_var("TQ_AUTO_START");
        env::remove_var("TQ_FFMPEG_BIN");
        env::remove_var("TQ_FFPROBE_BIN");
        env::remove_var("TQ_STATE_FILE");
        env::remove_var("TQ_LOG_DIR");
        env::remove_var("TQ_SERVER_ADDR");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_jobs in 0u32..32,
            auto_start in proptest::bool::ANY,
            persist_ms in 0u64..60_000,
            grace_ms in 0u64..100_000,
            interval_ms in 1u64..10_000,
            attempts in 1u32..10,
            delay_ms in 0u64..5_000,
        ) {
            let toml_str = format!(
                r#"
[queue]
max_parallel_jobs = {}
auto_start = {}
progress_persist_interval_ms = {}

[encoder]
ffmpeg_bin = "/opt/ffmpeg/bin/ffmpeg"

[paths]
state_file = "/srv/tq/jobs.json"
log_dir = "/srv/tq/logs"

[watchdog]
grace_ms = {}
interval_ms = {}

[retry]
attempts = {}
delay_ms = {}
"#,
                max_jobs, auto_start, persist_ms, grace_ms, interval_ms, attempts, delay_ms
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.queue.max_parallel_jobs, max_jobs);
            prop_assert_eq!(config.queue.auto_start, auto_start);
            prop_assert_eq!(config.queue.progress_persist_interval_ms, persist_ms);
            prop_assert_eq!(config.encoder.ffmpeg_bin, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
            prop_assert_eq!(config.encoder.ffprobe_bin, PathBuf::from("ffprobe"));
            prop_assert_eq!(config.paths.state_file, PathBuf::from("/srv/tq/jobs.json"));
            prop_assert_eq!(config.watchdog.grace_ms, grace_ms);
            prop_assert_eq!(config.watchdog.interval_ms, interval_ms);
            prop_assert_eq!(config.watchdog.max_ms, 300_000);
            prop_assert_eq!(config.retry.attempts, attempts);
            prop_assert_eq!(config.retry.delay_ms, delay_ms);
        }

        #[test]
        fn prop_env_overrides_max_parallel_jobs(
            initial_jobs in 0u32..8,
            override_jobs in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[queue]
max_parallel_jobs = {}
"#,
                initial_jobs
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TQ_MAX_PARALLEL_JOBS", override_jobs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.queue.max_parallel_jobs, override_jobs);
        }

        #[test]
        fn prop_env_overrides_auto_start(
            initial in proptest::bool::ANY,
            overridden in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[queue]
auto_start = {}
"#,
                initial
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TQ_AUTO_START", overridden.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.queue.auto_start, overridden);
        }
    }

    #[test]
    fn test_env_overrides_paths_and_binaries() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TQ_FFMPEG_BIN", "/usr/local/bin/ffmpeg");
        env::set_var("TQ_FFPROBE_BIN", "/usr/local/bin/ffprobe");
        env::set_var("TQ_STATE_FILE", "/data/jobs.json");
        env::set_var("TQ_LOG_DIR", "/data/logs");
        env::set_var("TQ_SERVER_ADDR", "0.0.0.0:9000");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.encoder.ffmpeg_bin, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(config.encoder.ffprobe_bin, PathBuf::from("/usr/local/bin/ffprobe"));
        assert_eq!(config.paths.state_file, PathBuf::from("/data/jobs.json"));
        assert_eq!(config.paths.log_dir, PathBuf::from("/data/logs"));
        assert_eq!(config.server.addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_auto_start_override_is_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TQ_AUTO_START", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.queue.auto_start);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.queue.max_parallel_jobs, 0);
        assert!(config.queue.auto_start);
        assert_eq!(config.queue.progress_persist_interval_ms, 2000);
        assert_eq!(config.encoder.ffmpeg_bin, PathBuf::from("ffmpeg"));
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.delay_ms, 500);
        assert_eq!(config.watchdog.grace_ms, 10_000);
        assert!(config.server.enabled);
        assert_eq!(config.server.addr, "127.0.0.1:7879");
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[retry]
attempts = 5
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.delay_ms, 500); // default
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.paths, PathsConfig::default());
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let result = Config::parse_toml("[queue\nmax_parallel_jobs = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = Config::load_from_file("/nonexistent/transcode-queue/config.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
