use std::sync::Arc;

use ht_types::{StorageResult, StudyHandle, TrialRecord};
use parking_lot::Mutex;

use crate::TrialStorage;

/// Shared handle that funnels every storage call through one lock.
///
/// Cloning is cheap; all clones talk to the same backend. The lock is never
/// held across an `.await`.
pub struct SerializedStorage<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SerializedStorage<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TrialStorage> SerializedStorage<S> {
    pub fn new(storage: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(storage)),
        }
    }

    pub fn create_or_load_study(&self, name: &str, sampler: &str) -> StorageResult<StudyHandle> {
        self.inner.lock().create_or_load_study(name, sampler)
    }

    pub fn persist_trial(&self, study: &StudyHandle, record: &TrialRecord) -> StorageResult<()> {
        self.inner.lock().persist_trial(study, record)
    }

    pub fn trials(&self, study: &StudyHandle) -> StorageResult<Vec<TrialRecord>> {
        self.inner.lock().trials(study)
    }

    pub fn query_best(&self, study: &StudyHandle) -> StorageResult<Option<TrialRecord>> {
        self.inner.lock().query_best(study)
    }
}
