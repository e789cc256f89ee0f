//! Worker pool that draws trials until the budget runs out or the run is
//! cancelled.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ht_storage::{SerializedStorage, TrialStorage};
use ht_types::{
    attrs, internal_error, EvaluationOutcome, EvaluationResult, FailurePolicy, HtError, HtResult,
    SchedulerConfig, StudyHandle, SuggestError, Trial, TrialNumber, TrialRecord, TrialStatus,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::objective::Evaluator;
use crate::search::Suggester;

/// Counts for one call to [`TrialScheduler::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Trials evaluated to an outcome and persisted (complete + failed).
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    /// Trials discarded because cancellation hit them mid-flight.
    pub cancelled: usize,
}

/// Map an evaluation onto the trial's final record, or `None` when it was
/// cancelled and must not be persisted.
pub fn finish_trial(mut trial: Trial, result: EvaluationResult) -> Option<TrialRecord> {
    match (result.outcome, result.score) {
        (EvaluationOutcome::Cancelled, _) => None,
        (EvaluationOutcome::Scored, Some(score)) => {
            if let Some(iteration) = result.iteration_reached {
                trial.set_attribute(attrs::BEST_ITERATION, iteration.to_string());
            }
            trial.set_attribute(attrs::STDOUT, result.stdout);
            trial.set_attribute(attrs::STDERR, result.stderr);
            Some(trial.complete(score))
        }
        (outcome, _) => {
            trial.set_attribute(attrs::OUTCOME, outcome.to_string());
            if let Some(error) = result.error {
                trial.set_attribute(attrs::ERROR, error);
            }
            if let Some(code) = result.exit_code {
                trial.set_attribute(attrs::EXIT_CODE, code.to_string());
            }
            if !result.stdout.is_empty() {
                trial.set_attribute(attrs::STDOUT, result.stdout);
            }
            if !result.stderr.is_empty() {
                trial.set_attribute(attrs::STDERR, result.stderr);
            }
            Some(trial.fail())
        }
    }
}

struct WorkerContext<S, E> {
    study: StudyHandle,
    suggester: Arc<dyn Suggester>,
    evaluator: Arc<E>,
    storage: SerializedStorage<S>,
    cancel: CancellationToken,
    policy: FailurePolicy,
    remaining: AtomicUsize,
    next_number: AtomicU64,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl<S, E> WorkerContext<S, E>
where
    S: TrialStorage + 'static,
    E: Evaluator + 'static,
{
    /// Take one unit of budget. Never goes below zero.
    fn claim_budget(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn suggest_parameters(&self, trial: &mut Trial) -> Result<(), SuggestError> {
        for def in &self.evaluator.search_space().parameters {
            let value = self.suggester.suggest(trial.number, &def.name, &def.domain)?;
            trial.parameters.insert(def.name.clone(), value);
        }
        Ok(())
    }

    async fn persist(&self, record: &TrialRecord) -> HtResult<()> {
        let storage = self.storage.clone();
        let study = self.study.clone();
        let owned = record.clone();
        tokio::task::spawn_blocking(move || storage.persist_trial(&study, &owned))
            .await
            .map_err(|e| internal_error!("storage writer task failed: {e}"))??;
        Ok(())
    }

    async fn worker_loop(&self, worker: usize) -> HtResult<()> {
        debug!(worker, "worker started");
        loop {
            if self.cancel.is_cancelled() {
                debug!(worker, "cancellation observed; worker exiting");
                break;
            }
            if !self.claim_budget() {
                debug!(worker, "budget exhausted; worker exiting");
                break;
            }

            let number = self.next_number.fetch_add(1, Ordering::SeqCst);
            let mut trial = Trial::new(number, worker);

            let record = match self.suggest_parameters(&mut trial) {
                Ok(()) => {
                    debug!(worker, trial = number, params = ?trial.parameters, "evaluating trial");
                    let result = self
                        .evaluator
                        .evaluate(number, &trial.parameters, &self.cancel)
                        .await;
                    match finish_trial(trial, result) {
                        Some(record) => record,
                        None => {
                            self.cancelled.fetch_add(1, Ordering::SeqCst);
                            self.suggester.discard(number);
                            info!(worker, trial = number, "trial cancelled; discarding");
                            break;
                        }
                    }
                }
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        self.cancelled.fetch_add(1, Ordering::SeqCst);
                        self.suggester.discard(number);
                        break;
                    }
                    trial.set_attribute(attrs::OUTCOME, "suggest_error");
                    trial.set_attribute(attrs::ERROR, e.to_string());
                    trial.fail()
                }
            };

            if let Err(e) = self.persist(&record).await {
                error!(
                    worker,
                    trial = number,
                    error = %e,
                    "failed to persist trial; stopping worker"
                );
                return Err(e);
            }
            self.suggester.observe(&record);

            match record.status {
                TrialStatus::Complete => {
                    self.completed.fetch_add(1, Ordering::SeqCst);
                    info!(worker, trial = number, value = ?record.value, "trial complete");
                }
                _ => {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    let reason = record
                        .attributes
                        .get(attrs::ERROR)
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string());
                    warn!(worker, trial = number, error = %reason, "trial failed");
                    if self.policy == FailurePolicy::Halt {
                        self.cancel.cancel();
                        return Err(HtError::TrialFailed {
                            trial: number,
                            message: reason,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn summary(&self) -> RunSummary {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        RunSummary {
            attempted: completed + failed,
            completed,
            failed,
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }
}

/// Runs trials on a fixed pool of workers sharing one budget.
///
/// Budget is claimed one trial at a time from a shared counter rather than
/// split up front, so slow or failing workers cannot shrink the total.
#[derive(Debug, Clone)]
pub struct TrialScheduler {
    config: SchedulerConfig,
}

impl TrialScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run trials for `study` until the budget is spent or `cancel` fires.
    ///
    /// Returns only once every worker has exited. A storage failure stops the
    /// affected worker and is returned after the join; other workers carry on.
    pub async fn run<S, E>(
        &self,
        study: &StudyHandle,
        suggester: Arc<dyn Suggester>,
        evaluator: Arc<E>,
        storage: SerializedStorage<S>,
        cancel: CancellationToken,
    ) -> HtResult<RunSummary>
    where
        S: TrialStorage + 'static,
        E: Evaluator + 'static,
    {
        if self.config.workers == 0 {
            return Err(HtError::Validation("worker count must be at least 1".into()));
        }

        // Warm the suggester with whatever the study already holds.
        let history = storage.trials(study)?;
        for record in &history {
            suggester.observe(record);
        }
        let next_number = next_trial_number(&history).max(study.next_trial_number);

        info!(
            study = %study.name,
            budget = self.config.budget,
            workers = self.config.workers,
            sampler = suggester.name(),
            history = history.len(),
            "starting trial scheduler"
        );

        let ctx = Arc::new(WorkerContext {
            study: study.clone(),
            suggester,
            evaluator,
            storage,
            cancel: cancel.child_token(),
            policy: self.config.failure_policy,
            remaining: AtomicUsize::new(self.config.budget),
            next_number: AtomicU64::new(next_number),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        });

        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers {
            let ctx = Arc::clone(&ctx);
            workers.spawn(async move { ctx.worker_loop(worker).await });
        }

        let mut first_error: Option<HtError> = None;
        while let Some(joined) = workers.join_next().await {
            let outcome =
                joined.unwrap_or_else(|e| Err(internal_error!("worker task failed: {e}")));
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        let summary = ctx.summary();
        info!(
            attempted = summary.attempted,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "trial scheduler finished"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// Next trial number a run would hand out, given existing records.
pub fn next_trial_number(records: &[TrialRecord]) -> TrialNumber {
    records.iter().map(|r| r.number + 1).max().unwrap_or(0)
}
