use std::sync::Arc;

use anyhow::Context;
use ht_optimizer::{
    suggester_for, CancellationController, ObjectiveRunner, ResultAggregator, TrialScheduler,
};
use ht_storage::{JournalStorage, SerializedStorage};
use ht_types::{HtError, TuneConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = TuneConfig::from_env().context("failed to read configuration")?;
    config.validate().context("invalid configuration")?;

    let journal = JournalStorage::open(&config.storage_path)
        .with_context(|| format!("failed to open storage at {}", config.storage_path.display()))?;
    let storage = SerializedStorage::new(journal);
    let study = storage
        .create_or_load_study(&config.study_name, config.sampler.as_str())
        .with_context(|| format!("failed to open study {}", config.study_name))?;

    info!(
        study = %study.name,
        id = %study.id,
        storage = %config.storage_path.display(),
        next_trial = study.next_trial_number,
        "study ready"
    );

    let suggester = suggester_for(config.sampler, config.exploration_weight, config.seed);
    let runner = Arc::new(ObjectiveRunner::new(
        config.evaluator.clone(),
        config.search_space.clone(),
    ));

    let cancel = CancellationToken::new();
    let controller = CancellationController::install(cancel.clone())
        .context("failed to install signal handlers")?;

    let scheduler = TrialScheduler::new(config.scheduler.clone());
    let outcome = scheduler
        .run(&study, suggester, runner, storage.clone(), cancel)
        .await;

    let cause = controller.cause();
    controller.close().await;
    if let Some(signal) = cause {
        info!(%signal, "run interrupted");
    }

    match &outcome {
        Ok(summary) => info!(
            attempted = summary.attempted,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "run finished"
        ),
        Err(e) => warn!(error = %e, "run ended with an error"),
    }

    match ResultAggregator::counts(&storage, &study) {
        Ok(counts) => info!(
            study = %study.name,
            complete = counts.complete,
            failed = counts.failed,
            total = counts.total(),
            "study totals"
        ),
        Err(e) => warn!(error = %e, "failed to count trials"),
    }

    match ResultAggregator::best_of(&storage, &study) {
        Ok(best) => info!(
            number = best.number,
            value = best.value,
            params = ?best.parameters,
            "best trial: {best}"
        ),
        Err(HtError::NoCompleteTrials { .. }) => warn!(study = %study.name, "no complete trials"),
        Err(e) => warn!(error = %e, "failed to read best trial"),
    }

    outcome.context("trial scheduler failed")?;
    Ok(())
}
