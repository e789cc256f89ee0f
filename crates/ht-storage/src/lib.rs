//! # ht-storage
//!
//! Durable record of studies and their finished trials.
//!
//! Backends implement [`TrialStorage`]. Writers take `&mut self`, and the
//! scheduler reaches a backend only through [`SerializedStorage`], so at most
//! one writer proceeds at a time.

mod journal;
mod memory;
mod serialized;

pub use journal::JournalStorage;
pub use memory::MemoryStorage;
pub use serialized::SerializedStorage;

use ht_types::{select_best, StorageResult, StudyHandle, TrialRecord};

/// Storage contract consumed by the scheduler and the result aggregator.
pub trait TrialStorage: Send {
    /// Open the study called `name`, creating it if it does not exist yet.
    ///
    /// The returned handle carries the first unused trial number so numbering
    /// continues across runs.
    fn create_or_load_study(&mut self, name: &str, sampler: &str) -> StorageResult<StudyHandle>;

    /// Persist the final record of a trial. Each trial number is accepted once.
    fn persist_trial(&mut self, study: &StudyHandle, record: &TrialRecord) -> StorageResult<()>;

    /// All persisted trials of a study, ordered by trial number.
    fn trials(&self, study: &StudyHandle) -> StorageResult<Vec<TrialRecord>>;

    /// The complete trial with the lowest value, ties going to the lowest number.
    fn query_best(&self, study: &StudyHandle) -> StorageResult<Option<TrialRecord>> {
        let trials = self.trials(study)?;
        Ok(select_best(&trials).cloned())
    }
}
