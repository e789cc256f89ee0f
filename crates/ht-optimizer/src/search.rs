//! Parameter suggesters.
//!
//! The scheduler asks for one axis at a time, keyed by trial number, and
//! reports every finished trial back through [`Suggester::observe`] so
//! adaptive strategies can learn from the history.

use std::collections::HashMap;

use ht_types::{
    ParameterDomain, ParameterSet, ParameterValue, SamplerKind, SuggestError, TrialNumber,
    TrialRecord,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Common trait for all parameter suggestion strategies.
///
/// Implementations are shared by every worker and must serialize internally.
pub trait Suggester: Send + Sync {
    /// Suggest a value for axis `name` of trial `trial`.
    fn suggest(
        &self,
        trial: TrialNumber,
        name: &str,
        domain: &ParameterDomain,
    ) -> Result<ParameterValue, SuggestError>;

    /// Report a finished trial so adaptive strategies can learn.
    fn observe(&self, _record: &TrialRecord) {}

    /// Forget a trial that was abandoned without a result.
    fn discard(&self, _trial: TrialNumber) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;

    fn suggest_log_uniform(
        &self,
        trial: TrialNumber,
        name: &str,
        low: f64,
        high: f64,
    ) -> Result<f64, SuggestError> {
        match self.suggest(trial, name, &ParameterDomain::LogUniform { low, high })? {
            ParameterValue::Float(v) => Ok(v),
            ParameterValue::Int(v) => Ok(v as f64),
        }
    }

    fn suggest_int(
        &self,
        trial: TrialNumber,
        name: &str,
        low: i64,
        high: i64,
    ) -> Result<i64, SuggestError> {
        match self.suggest(trial, name, &ParameterDomain::IntRange { low, high })? {
            ParameterValue::Int(v) => Ok(v),
            ParameterValue::Float(v) => Err(SuggestError::InvalidDomain {
                parameter: name.to_string(),
                message: format!("expected an integer, got {v}"),
            }),
        }
    }
}

/// Build the suggester named by `kind`.
pub fn suggester_for(
    kind: SamplerKind,
    exploration_weight: f64,
    seed: Option<u64>,
) -> Arc<dyn Suggester> {
    match kind {
        SamplerKind::Random => Arc::new(RandomSuggester::new(seed)),
        SamplerKind::Adaptive => Arc::new(AdaptiveSuggester::new(exploration_weight, seed)),
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Draw one value from `domain`. The domain must already be validated.
fn sample_domain<R: Rng>(rng: &mut R, domain: &ParameterDomain) -> ParameterValue {
    match *domain {
        ParameterDomain::IntRange { low, high } => {
            ParameterValue::Int(rng.random_range(low..=high))
        }
        ParameterDomain::LogUniform { low, high } => {
            let log_val: f64 = rng.random_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp().clamp(low, high))
        }
    }
}

// ---- Random ----

/// Independent random sampling across the search space.
#[derive(Debug)]
pub struct RandomSuggester {
    rng: Mutex<StdRng>,
}

impl RandomSuggester {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: Mutex::new(make_rng(seed)),
        }
    }
}

impl Suggester for RandomSuggester {
    fn suggest(
        &self,
        _trial: TrialNumber,
        name: &str,
        domain: &ParameterDomain,
    ) -> Result<ParameterValue, SuggestError> {
        domain.validate(name)?;
        Ok(sample_domain(&mut *self.rng.lock(), domain))
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Adaptive (explore / exploit) ----

#[derive(Debug)]
struct PendingTrial {
    /// Parameter vector being perturbed, or `None` when exploring.
    base: Option<ParameterSet>,
    values: ParameterSet,
}

#[derive(Debug)]
struct AdaptiveState {
    rng: StdRng,
    pending: HashMap<TrialNumber, PendingTrial>,
    observations: Vec<(ParameterSet, f64)>,
}

impl AdaptiveState {
    /// Lowest observed value wins.
    fn best(&self) -> Option<&ParameterSet> {
        self.observations
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(params, _)| params)
    }
}

/// Biases sampling toward the best trial seen so far.
///
/// Each trial either explores (pure random draw, chosen with probability
/// `exploration_weight` or whenever there is no history) or exploits by
/// perturbing the best observed parameter vector. The choice is made once per
/// trial, on its first axis, so all axes of one trial move together.
#[derive(Debug)]
pub struct AdaptiveSuggester {
    exploration_weight: f64,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveSuggester {
    pub fn new(exploration_weight: f64, seed: Option<u64>) -> Self {
        Self {
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            state: Mutex::new(AdaptiveState {
                rng: make_rng(seed),
                pending: HashMap::new(),
                observations: Vec::new(),
            }),
        }
    }

    /// Number of scored trials the suggester has learned from.
    pub fn observation_count(&self) -> usize {
        self.state.lock().observations.len()
    }

    /// Trials that received suggestions but have not been observed yet.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn perturb<R: Rng>(
        rng: &mut R,
        domain: &ParameterDomain,
        base: ParameterValue,
    ) -> Option<ParameterValue> {
        let value = match (*domain, base) {
            (ParameterDomain::IntRange { low, high }, ParameterValue::Int(v)) => {
                let delta: i64 = rng.random_range(-2..=2);
                ParameterValue::Int(v.saturating_add(delta).clamp(low, high))
            }
            (ParameterDomain::LogUniform { low, high }, ParameterValue::Float(v)) if v > 0.0 => {
                let log_range = high.ln() - low.ln();
                let noise = rng.random_range(-0.1..0.1) * log_range;
                ParameterValue::Float((v.ln() + noise).exp().clamp(low, high))
            }
            _ => return None,
        };
        Some(value)
    }
}

impl Suggester for AdaptiveSuggester {
    fn suggest(
        &self,
        trial: TrialNumber,
        name: &str,
        domain: &ParameterDomain,
    ) -> Result<ParameterValue, SuggestError> {
        domain.validate(name)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.pending.contains_key(&trial) {
            let explore = state.observations.is_empty()
                || state.rng.random::<f64>() < self.exploration_weight;
            let base = if explore { None } else { state.best().cloned() };
            state.pending.insert(
                trial,
                PendingTrial {
                    base,
                    values: ParameterSet::new(),
                },
            );
        }
        let Some(pending) = state.pending.get_mut(&trial) else {
            return Err(SuggestError::Poisoned {
                message: format!("pending entry for trial {trial} vanished"),
            });
        };

        if let Some(existing) = pending.values.get(name) {
            return Ok(*existing);
        }

        let perturbed = pending
            .base
            .as_ref()
            .and_then(|base| base.get(name).copied())
            .and_then(|base| Self::perturb(&mut state.rng, domain, base));
        let value = match perturbed {
            Some(value) => value,
            None => sample_domain(&mut state.rng, domain),
        };

        pending.values.insert(name.to_string(), value);
        Ok(value)
    }

    fn observe(&self, record: &TrialRecord) {
        let mut state = self.state.lock();
        state.pending.remove(&record.number);
        if let Some(value) = record.complete_value() {
            state.observations.push((record.parameters.clone(), value));
        }
    }

    fn discard(&self, trial: TrialNumber) {
        self.state.lock().pending.remove(&trial);
    }

    fn name(&self) -> &str {
        "adaptive"
    }
}
