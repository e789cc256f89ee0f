//! Run configuration with fixed defaults and environment overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::HtResult;
use crate::search::SearchSpace;
use crate::trial::TrialNumber;
use crate::{config_error, validation_error};

pub const ENV_EVALUATOR_BIN: &str = "HT_EVALUATOR_BIN";
pub const ENV_STORAGE_PATH: &str = "HT_STORAGE_PATH";
pub const ENV_STUDY_NAME: &str = "HT_STUDY_NAME";
pub const ENV_TRIAL_BUDGET: &str = "HT_TRIAL_BUDGET";
pub const ENV_WORKERS: &str = "HT_WORKERS";
pub const ENV_TRIAL_TIMEOUT_SECS: &str = "HT_TRIAL_TIMEOUT_SECS";
pub const ENV_SEED: &str = "HT_SEED";

/// Which suggester drives the study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    Random,
    Adaptive,
}

impl SamplerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Adaptive => "adaptive",
        }
    }
}

/// What a worker does when one of its trials fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and keep scheduling.
    Continue,
    /// Cancel the whole run on the first failed trial.
    Halt,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Continue
    }
}

/// Maps a search-space axis onto an evaluator command-line flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgBinding {
    pub parameter: String,
    pub flag: String,
}

impl ArgBinding {
    pub fn new(parameter: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            flag: flag.into(),
        }
    }
}

/// How the external evaluator is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub binary: PathBuf,
    pub validation_path: PathBuf,
    pub train_path: PathBuf,
    pub auto_stop: bool,
    /// Early-stopping patience, in iterations without improvement.
    pub auto_stop_threshold: u32,
    pub max_iterations: u32,
    /// Directory holding the per-trial metadata files.
    pub meta_dir: PathBuf,
    pub meta_prefix: String,
    pub bindings: Vec<ArgBinding>,
    /// Wall-clock limit for one evaluator run. `None` = unlimited.
    pub timeout_secs: Option<u64>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./ffm-train"),
            validation_path: PathBuf::from("./data/valid2.txt"),
            train_path: PathBuf::from("./data/train2.txt"),
            auto_stop: true,
            auto_stop_threshold: 3,
            max_iterations: 500,
            meta_dir: PathBuf::from("./data/optuna"),
            meta_prefix: "ffm-meta".to_string(),
            bindings: vec![
                ArgBinding::new("lambda", "-l"),
                ArgBinding::new("eta", "-r"),
                ArgBinding::new("latent", "-k"),
            ],
            timeout_secs: None,
        }
    }
}

impl EvaluatorConfig {
    /// Scratch file the evaluator writes its metadata record to for `trial`.
    pub fn meta_path(&self, trial: TrialNumber) -> PathBuf {
        self.meta_dir
            .join(format!("{}-{}.json", self.meta_prefix, trial))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_meta_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.meta_dir = dir.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Worker pool and budget settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Total number of trial attempts the run may consume.
    pub budget: usize,
    pub workers: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            budget: 1000,
            workers: default_workers(),
            failure_policy: FailurePolicy::Continue,
        }
    }
}

impl SchedulerConfig {
    pub fn new(budget: usize, workers: usize) -> Self {
        Self {
            budget,
            workers,
            failure_policy: FailurePolicy::Continue,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// One worker per available core, minus one kept for orchestration and
/// signal handling.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .saturating_sub(1)
        .max(1)
}

/// Top-level configuration for a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneConfig {
    pub study_name: String,
    pub storage_path: PathBuf,
    pub sampler: SamplerKind,
    /// Exploration weight for the adaptive sampler (ignored for random).
    pub exploration_weight: f64,
    pub seed: Option<u64>,
    pub search_space: SearchSpace,
    pub evaluator: EvaluatorConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            study_name: "libffm-tune".to_string(),
            storage_path: PathBuf::from("db.jsonl"),
            sampler: SamplerKind::Adaptive,
            exploration_weight: 0.3,
            seed: None,
            search_space: SearchSpace::new()
                .add_log_uniform("lambda", 1e-6, 1.0)
                .add_log_uniform("eta", 1e-6, 1.0)
                .add_int("latent", 1, 16),
            evaluator: EvaluatorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl TuneConfig {
    /// Defaults overridden by `HT_*` environment variables.
    pub fn from_env() -> HtResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `HT_*` keys.
    pub fn from_lookup<F>(lookup: F) -> HtResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(bin) = lookup(ENV_EVALUATOR_BIN) {
            config.evaluator.binary = PathBuf::from(bin);
        }
        if let Some(path) = lookup(ENV_STORAGE_PATH) {
            config.storage_path = PathBuf::from(path);
        }
        if let Some(name) = lookup(ENV_STUDY_NAME) {
            config.study_name = name;
        }
        if let Some(budget) = parse_var(&lookup, ENV_TRIAL_BUDGET)? {
            config.scheduler.budget = budget;
        }
        if let Some(workers) = parse_var(&lookup, ENV_WORKERS)? {
            config.scheduler.workers = workers;
        }
        if let Some(secs) = parse_var(&lookup, ENV_TRIAL_TIMEOUT_SECS)? {
            config.evaluator.timeout_secs = Some(secs);
        }
        if let Some(seed) = parse_var(&lookup, ENV_SEED)? {
            config.seed = Some(seed);
        }

        Ok(config)
    }

    pub fn with_study_name(mut self, name: impl Into<String>) -> Self {
        self.study_name = name.into();
        self
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.scheduler.budget = budget;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.scheduler.workers = workers;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerKind) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn validate(&self) -> HtResult<()> {
        if self.study_name.trim().is_empty() {
            return Err(validation_error!("study name must not be empty"));
        }
        if self.scheduler.budget == 0 {
            return Err(validation_error!("trial budget must be at least 1"));
        }
        if self.scheduler.workers == 0 {
            return Err(validation_error!("worker count must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.exploration_weight) {
            return Err(validation_error!(
                "exploration weight must be within [0, 1], got {}",
                self.exploration_weight
            ));
        }
        if self.search_space.is_empty() {
            return Err(validation_error!("search space has no parameters"));
        }
        self.search_space.validate()?;
        for binding in &self.evaluator.bindings {
            if self.search_space.get(&binding.parameter).is_none() {
                return Err(validation_error!(
                    "evaluator flag {} is bound to unknown parameter {}",
                    binding.flag,
                    binding.parameter
                ));
            }
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> HtResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| config_error!("{key}={raw:?} is invalid: {e}")),
    }
}
