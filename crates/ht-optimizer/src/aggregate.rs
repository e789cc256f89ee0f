//! Best-trial selection over everything a study has recorded.

use std::collections::BTreeMap;
use std::fmt;

use ht_storage::{SerializedStorage, TrialStorage};
use ht_types::{
    select_best, HtError, HtResult, ParameterSet, StudyHandle, TrialNumber, TrialRecord,
    TrialStatus,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The winning trial of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTrial {
    pub number: TrialNumber,
    pub value: f64,
    pub parameters: ParameterSet,
    pub attributes: BTreeMap<String, String>,
}

impl BestTrial {
    fn from_record(record: &TrialRecord, value: f64) -> Self {
        Self {
            number: record.number,
            value,
            parameters: record.parameters.clone(),
            attributes: record.attributes.clone(),
        }
    }
}

impl fmt::Display for BestTrial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trial {} value={}", self.number, self.value)?;
        for (name, value) in &self.parameters {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

/// Per-status counts for a study.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyCounts {
    pub complete: usize,
    pub failed: usize,
}

impl StudyCounts {
    pub fn total(&self) -> usize {
        self.complete + self.failed
    }
}

/// Reads a study back out of storage and reports on it.
///
/// Looks at every recorded trial, including ones written by earlier runs of
/// the same study. Lower values win; ties go to the lower trial number.
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn best_of_records(study: &str, records: &[TrialRecord]) -> HtResult<BestTrial> {
        select_best(records)
            .and_then(|record| {
                record
                    .complete_value()
                    .map(|value| BestTrial::from_record(record, value))
            })
            .ok_or_else(|| HtError::NoCompleteTrials {
                study: study.to_string(),
            })
    }

    pub fn best_of<S: TrialStorage>(
        storage: &SerializedStorage<S>,
        study: &StudyHandle,
    ) -> HtResult<BestTrial> {
        let records = storage.trials(study)?;
        debug!(study = %study.name, trials = records.len(), "selecting best trial");
        Self::best_of_records(&study.name, &records)
    }

    pub fn counts<S: TrialStorage>(
        storage: &SerializedStorage<S>,
        study: &StudyHandle,
    ) -> HtResult<StudyCounts> {
        let mut counts = StudyCounts::default();
        for record in storage.trials(study)? {
            match record.status {
                TrialStatus::Complete => counts.complete += 1,
                TrialStatus::Failed => counts.failed += 1,
                TrialStatus::Running => {}
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ht_storage::MemoryStorage;
    use ht_types::{ParameterValue, Trial};

    fn record(number: TrialNumber, value: Option<f64>) -> TrialRecord {
        let mut trial = Trial::new(number, 0);
        trial
            .parameters
            .insert("latent".into(), ParameterValue::Int(number as i64 + 1));
        match value {
            Some(v) => trial.complete(v),
            None => trial.fail(),
        }
    }

    fn storage_with(records: &[TrialRecord]) -> (SerializedStorage<MemoryStorage>, StudyHandle) {
        let storage = SerializedStorage::new(MemoryStorage::new());
        let study = storage.create_or_load_study("agg", "random").unwrap();
        for r in records {
            storage.persist_trial(&study, r).unwrap();
        }
        (storage, study)
    }

    #[test]
    fn lowest_value_wins() {
        let (storage, study) = storage_with(&[
            record(0, Some(0.21)),
            record(1, Some(0.18)),
            record(2, None),
            record(3, Some(0.19)),
        ]);

        let best = ResultAggregator::best_of(&storage, &study).unwrap();
        assert_eq!(best.number, 1);
        assert_eq!(best.value, 0.18);
        assert_eq!(best.parameters.get("latent"), Some(&ParameterValue::Int(2)));

        let counts = ResultAggregator::counts(&storage, &study).unwrap();
        assert_eq!(counts, StudyCounts { complete: 3, failed: 1 });
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn ties_go_to_the_earliest_trial() {
        let (storage, study) = storage_with(&[
            record(4, Some(0.2)),
            record(2, Some(0.2)),
            record(9, Some(0.2)),
        ]);
        assert_eq!(ResultAggregator::best_of(&storage, &study).unwrap().number, 2);
    }

    #[test]
    fn no_complete_trials_is_an_error() {
        let (storage, study) = storage_with(&[record(0, None), record(1, None)]);
        let err = ResultAggregator::best_of(&storage, &study).unwrap_err();
        assert!(matches!(err, HtError::NoCompleteTrials { ref study } if study == "agg"));

        let (storage, study) = storage_with(&[]);
        assert!(ResultAggregator::best_of(&storage, &study).is_err());
    }

    #[test]
    fn display_lists_parameters() {
        let best = ResultAggregator::best_of_records("s", &[record(3, Some(0.5))]).unwrap();
        assert_eq!(best.to_string(), "trial 3 value=0.5 latent=4");
    }
}
