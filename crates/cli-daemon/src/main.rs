//! CLI entry point for the transcode queue daemon
//!
//! Parses command line arguments, sets up logging and either runs the daemon
//! or inspects the persisted queue.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transcode_queue::job_log::read_job_log;
use transcode_queue::{run_startup_checks, Config, Daemon, DaemonError, JobStore};

/// Persistent priority queue for ffmpeg transcodes
#[derive(Parser, Debug)]
#[command(name = "tqd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run {
        /// Skip startup checks (ffmpeg, ffprobe). For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
    /// Run the startup checks and exit
    Check,
    /// Print the persisted queue
    List,
    /// Print the log of one job
    Log { job_id: String },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_daemon(config: Config, skip_checks: bool) -> Result<(), DaemonError> {
    let daemon = if skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)?
    } else {
        Daemon::new(config)?
    };
    if daemon.config.server.enabled {
        info!(addr = %daemon.config.server.addr, "status server enabled");
    }
    daemon.run().await
}

fn list_jobs(config: &Config) -> Result<(), String> {
    let doc = JobStore::new(&config.paths.state_file)
        .load()
        .map_err(|e| e.to_string())?;
    println!(
        "max parallel jobs: {}  auto start: {}",
        doc.config.max_parallel_jobs, doc.config.auto_start
    );
    for job in &doc.jobs {
        println!(
            "{}  {:<10} {:>4} {:>6.1}%  {}",
            job.id,
            job.status.to_string(),
            job.priority,
            job.progress,
            job.input_path.display()
        );
        if let Some(err) = &job.error {
            println!("    error: {}", err);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let command = args.command.unwrap_or(Command::Run { skip_checks: false });
    let result = match command {
        Command::Run { skip_checks } => run_daemon(config, skip_checks)
            .await
            .map_err(|e| e.to_string()),
        Command::Check => run_startup_checks(&config)
            .map(|report| println!("ffmpeg major version: {:?}", report.ffmpeg_major))
            .map_err(|e| e.to_string()),
        Command::List => list_jobs(&config),
        Command::Log { job_id } => read_job_log(&config.paths.log_dir, &job_id)
            .map(|log| print!("{}", log))
            .map_err(|e| format!("no log for job {}: {}", job_id, e)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
