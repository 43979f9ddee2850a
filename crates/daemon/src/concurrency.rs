//! Concurrency planning
//!
//! Decides how many jobs may be in flight at once. An explicit value in the
//! configuration file wins, then the value persisted in the job store, and
//! finally a default derived from the CPU core count.

/// Where the effective job limit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    Config,
    Store,
    Derived,
}

/// Concurrency plan derived from configuration, store and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of jobs processing or verifying at once
    pub max_parallel_jobs: u32,
    pub source: PlanSource,
}

impl ConcurrencyPlan {
    /// Resolves the job limit. Zero means "not set" for both inputs.
    pub fn derive(configured: u32, stored: u32, total_cores: u32) -> Self {
        let (max_parallel_jobs, source) = if configured > 0 {
            (configured, PlanSource::Config)
        } else if stored > 0 {
            (stored, PlanSource::Store)
        } else {
            (derive_max_jobs(total_cores), PlanSource::Derived)
        };

        Self {
            total_cores,
            max_parallel_jobs,
            source,
        }
    }
}

/// Derive max parallel jobs based on core count
/// - 2 jobs for 16+ cores
/// - 1 job otherwise
///
/// ffmpeg already spreads one encode over every core.
fn derive_max_jobs(cores: u32) -> u32 {
    if cores >= 16 {
        2
    } else {
        1
    }
}

/// Public function to derive a concurrency plan, detecting the core count
/// via num_cpus
pub fn derive_plan(configured: u32, stored: u32) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(configured, stored, num_cpus::get() as u32)
}
