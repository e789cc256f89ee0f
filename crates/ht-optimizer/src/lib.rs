//! # ht-optimizer
//!
//! Concurrent hyperparameter search for an external trainer binary.
//!
//! A [`TrialScheduler`] runs a fixed pool of workers against a shared trial
//! budget. Each worker asks a [`Suggester`] for parameters, hands them to an
//! [`Evaluator`] (normally the subprocess-backed [`ObjectiveRunner`]) and
//! records the outcome through a serialized storage handle. A
//! [`CancellationController`] turns termination signals into cooperative
//! cancellation, and [`ResultAggregator`] picks the winning trial afterwards.

mod aggregate;
mod cancel;
mod objective;
mod scheduler;
mod search;

pub use aggregate::{BestTrial, ResultAggregator, StudyCounts};
pub use cancel::{CancellationController, TerminationSignal};
pub use objective::{classify_meta, Evaluator, EvaluatorMeta, ObjectiveRunner};
pub use scheduler::{finish_trial, next_trial_number, RunSummary, TrialScheduler};
pub use search::{suggester_for, AdaptiveSuggester, RandomSuggester, Suggester};
