//! # hpo-trial
//!
//! Single-trial hyperparameter-optimization runner.
//!
//! A [`TrialRunner`] provisions a local cluster sized to the available
//! accelerators, then for every fold ingests the dataset (cached after the
//! first read), drops incomplete rows, splits and persists the data on the
//! workers, fits the configured tree ensemble, scores it, keeps the best model
//! on disk and recycles the cluster. The last line it prints,
//! `final-score: <value>;`, is the objective the HPO controller reads.

pub mod report;
pub mod runner;
pub mod session;
pub mod timing;

pub use report::{final_score_line, write_report, TrialSummary};
pub use runner::{SplitHandles, TrialRunner};
pub use session::{BestState, ScoreLog, TrialSession};
pub use timing::{timed, timed_async, StageTiming};

use tracing_subscriber::EnvFilter;

/// Environment variable holding the configuration path when no argument is given.
pub const CONFIG_ENV: &str = "HPO_TRIAL_CONFIG";

/// Log filter used when `RUST_LOG` is unset: progress at info, workers quiet.
pub const DEFAULT_LOG_FILTER: &str = "info,hpo_cluster::worker=error";

/// Formatting subscriber for the runner. Events go to stderr: stdout carries
/// only the report, and worker threads never contend for its lock.
pub fn log_subscriber(filter: EnvFilter) -> impl tracing::Subscriber + Send + Sync + 'static {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_silences_workers() {
        assert!(DEFAULT_LOG_FILTER.ends_with(hpo_cluster::QUIET_WORKER_DIRECTIVE));
    }
}
