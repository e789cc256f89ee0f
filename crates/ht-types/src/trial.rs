//! Trial lifecycle and study identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::search::ParameterSet;

/// Unique study identifier.
pub type StudyId = Uuid;

/// Monotonically assigned trial number within a study.
pub type TrialNumber = u64;

/// Attribute keys written by the scheduler.
pub mod attrs {
    pub const BEST_ITERATION: &str = "best_iteration";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    pub const OUTCOME: &str = "outcome";
    pub const ERROR: &str = "error";
    pub const EXIT_CODE: &str = "exit_code";
}

/// Handle to a study opened through a storage backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyHandle {
    pub id: StudyId,
    pub name: String,
    /// Sampler kind recorded when the study was first created.
    pub sampler: String,
    pub created_at: DateTime<Utc>,
    /// First trial number not yet used by any persisted trial.
    pub next_trial_number: TrialNumber,
}

impl StudyHandle {
    pub fn new(name: impl Into<String>, sampler: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            sampler: sampler.into(),
            created_at: Utc::now(),
            next_trial_number: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Running,
    Complete,
    Failed,
}

/// A trial in flight.
///
/// Owned by the worker that created it. Finishing consumes it, so the final
/// value, status and attributes are fixed exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub number: TrialNumber,
    pub parameters: ParameterSet,
    pub worker: usize,
    pub started_at: DateTime<Utc>,
    attributes: BTreeMap<String, String>,
}

impl Trial {
    pub fn new(number: TrialNumber, worker: usize) -> Self {
        Self {
            number,
            parameters: ParameterSet::new(),
            worker,
            started_at: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    /// Attach an attribute. Existing keys are never overwritten.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn complete(self, value: f64) -> TrialRecord {
        self.finish(TrialStatus::Complete, Some(value))
    }

    pub fn fail(self) -> TrialRecord {
        self.finish(TrialStatus::Failed, None)
    }

    fn finish(self, status: TrialStatus, value: Option<f64>) -> TrialRecord {
        TrialRecord {
            number: self.number,
            parameters: self.parameters,
            attributes: self.attributes,
            status,
            value,
            worker: Some(self.worker),
            started_at: self.started_at,
            finished_at: Some(Utc::now()),
        }
    }
}

/// The durable copy of a finished trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub number: TrialNumber,
    pub parameters: ParameterSet,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub status: TrialStatus,
    /// Objective value; only meaningful when `status` is `Complete`.
    pub value: Option<f64>,
    #[serde(default)]
    pub worker: Option<usize>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrialRecord {
    /// Objective value of a complete trial.
    pub fn complete_value(&self) -> Option<f64> {
        match self.status {
            TrialStatus::Complete => self.value.filter(|v| !v.is_nan()),
            _ => None,
        }
    }
}

/// Pick the complete trial with the minimum value.
///
/// Ties go to the lowest trial number, regardless of slice order. Failed
/// trials do not participate.
pub fn select_best<'a, I>(records: I) -> Option<&'a TrialRecord>
where
    I: IntoIterator<Item = &'a TrialRecord>,
{
    let mut best: Option<(&TrialRecord, f64)> = None;
    for record in records {
        let Some(value) = record.complete_value() else {
            continue;
        };
        let better = match best {
            None => true,
            Some((current, current_value)) => {
                value < current_value || (value == current_value && record.number < current.number)
            }
        };
        if better {
            best = Some((record, value));
        }
    }
    best.map(|(record, _)| record)
}
