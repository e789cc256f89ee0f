use std::collections::{BTreeMap, HashMap};

use ht_types::{StorageError, StorageResult, StudyHandle, TrialNumber, TrialRecord};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct StudyState {
    handle: StudyHandle,
    trials: BTreeMap<TrialNumber, TrialRecord>,
}

/// In-memory trial store. Also the replay target of [`crate::JournalStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    studies: HashMap<String, StudyState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn study_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.studies.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn study_handle(&self, name: &str) -> Option<StudyHandle> {
        self.studies.get(name).map(|state| state.handle.clone())
    }

    /// Register a study created elsewhere (used when replaying a journal).
    pub(crate) fn insert_study(&mut self, handle: StudyHandle) {
        self.studies
            .entry(handle.name.clone())
            .or_insert_with(|| StudyState {
                handle,
                trials: BTreeMap::new(),
            });
    }

    /// Returns the handle for `name` and whether it was newly created.
    pub(crate) fn open_study(&mut self, name: &str, sampler: &str) -> (StudyHandle, bool) {
        if let Some(state) = self.studies.get(name) {
            if state.handle.sampler != sampler {
                warn!(
                    study = %name,
                    recorded = %state.handle.sampler,
                    requested = %sampler,
                    "study was created with a different sampler; keeping the recorded one"
                );
            }
            return (state.handle.clone(), false);
        }

        let handle = StudyHandle::new(name, sampler);
        self.insert_study(handle.clone());
        (handle, true)
    }

    fn state(&self, study: &StudyHandle) -> StorageResult<&StudyState> {
        self.studies
            .get(&study.name)
            .filter(|state| state.handle.id == study.id)
            .ok_or_else(|| StorageError::StudyNotFound {
                name: study.name.clone(),
            })
    }

    /// Reject records that cannot be stored, without mutating anything.
    pub(crate) fn check_insert(
        &self,
        study: &StudyHandle,
        record: &TrialRecord,
    ) -> StorageResult<()> {
        let state = self.state(study)?;
        if state.trials.contains_key(&record.number) {
            return Err(StorageError::DuplicateTrial {
                study: study.name.clone(),
                number: record.number,
            });
        }
        Ok(())
    }

    pub(crate) fn insert_trial(
        &mut self,
        study: &StudyHandle,
        record: TrialRecord,
    ) -> StorageResult<()> {
        self.check_insert(study, &record)?;
        let state = self
            .studies
            .get_mut(&study.name)
            .ok_or_else(|| StorageError::StudyNotFound {
                name: study.name.clone(),
            })?;
        state.handle.next_trial_number = state.handle.next_trial_number.max(record.number + 1);
        state.trials.insert(record.number, record);
        Ok(())
    }
}

impl crate::TrialStorage for MemoryStorage {
    fn create_or_load_study(&mut self, name: &str, sampler: &str) -> StorageResult<StudyHandle> {
        let (handle, created) = self.open_study(name, sampler);
        debug!(study = %name, created, next_trial = handle.next_trial_number, "opened study");
        Ok(handle)
    }

    fn persist_trial(&mut self, study: &StudyHandle, record: &TrialRecord) -> StorageResult<()> {
        self.insert_trial(study, record.clone())
    }

    fn trials(&self, study: &StudyHandle) -> StorageResult<Vec<TrialRecord>> {
        Ok(self.state(study)?.trials.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrialStorage;
    use ht_types::{ParameterValue, Trial, TrialStatus};

    fn complete(number: TrialNumber, value: f64) -> TrialRecord {
        let mut trial = Trial::new(number, 0);
        trial
            .parameters
            .insert("latent".into(), ParameterValue::Int(4));
        trial.complete(value)
    }

    #[test]
    fn create_then_load_returns_same_study() {
        let mut storage = MemoryStorage::new();
        let first = storage.create_or_load_study("libffm", "adaptive").unwrap();
        let again = storage.create_or_load_study("libffm", "random").unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.sampler, "adaptive");
        assert_eq!(storage.study_names(), vec!["libffm".to_string()]);
    }

    #[test]
    fn persist_and_query_best() {
        let mut storage = MemoryStorage::new();
        let study = storage.create_or_load_study("s", "random").unwrap();

        storage.persist_trial(&study, &complete(0, 0.5)).unwrap();
        storage.persist_trial(&study, &complete(1, 0.2)).unwrap();
        storage
            .persist_trial(&study, &Trial::new(2, 1).fail())
            .unwrap();

        let trials = storage.trials(&study).unwrap();
        assert_eq!(trials.len(), 3);
        assert_eq!(trials[2].status, TrialStatus::Failed);

        let best = storage.query_best(&study).unwrap().unwrap();
        assert_eq!(best.number, 1);
        assert_eq!(best.value, Some(0.2));
    }

    #[test]
    fn duplicate_trial_is_rejected() {
        let mut storage = MemoryStorage::new();
        let study = storage.create_or_load_study("s", "random").unwrap();
        storage.persist_trial(&study, &complete(3, 0.5)).unwrap();
        let err = storage.persist_trial(&study, &complete(3, 0.4)).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateTrial { number: 3, .. }));
    }

    #[test]
    fn unknown_study_is_rejected() {
        let mut storage = MemoryStorage::new();
        let stranger = StudyHandle::new("nope", "random");
        assert!(matches!(
            storage.persist_trial(&stranger, &complete(0, 1.0)),
            Err(StorageError::StudyNotFound { .. })
        ));
        assert!(storage.trials(&stranger).is_err());
    }

    #[test]
    fn reload_continues_trial_numbering() {
        let mut storage = MemoryStorage::new();
        let study = storage.create_or_load_study("s", "random").unwrap();
        assert_eq!(study.next_trial_number, 0);
        storage.persist_trial(&study, &complete(0, 0.5)).unwrap();
        storage.persist_trial(&study, &complete(4, 0.5)).unwrap();

        let reloaded = storage.create_or_load_study("s", "random").unwrap();
        assert_eq!(reloaded.next_trial_number, 5);
    }
}
