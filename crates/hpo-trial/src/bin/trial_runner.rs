use anyhow::Context;
use hpo_trial::{log_subscriber, TrialRunner, CONFIG_ENV, DEFAULT_LOG_FILTER};
use hpo_types::TrialConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing::subscriber::set_global_default(log_subscriber(filter))?;

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .with_context(|| format!("usage: hpo-trial <config.json> (or set {CONFIG_ENV})"))?;

    let config = TrialConfig::from_json_file(&path)
        .with_context(|| format!("failed to load trial configuration from {path}"))?;

    let mut runner = TrialRunner::new(config)?;
    let summary = runner.run(&mut std::io::stdout()).await?;

    tracing::info!(
        trial = %summary.trial_id,
        final_score = summary.final_score,
        best_score = summary.best_score,
        "trial complete"
    );
    tracing::debug!(summary = %serde_json::to_string(&summary)?, "trial summary");
    Ok(())
}
