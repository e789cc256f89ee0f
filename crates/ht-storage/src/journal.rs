//! Append-only JSON-lines journal.
//!
//! Every study creation and every finished trial is one line. Opening a
//! journal replays it into a [`MemoryStorage`] mirror; reads are served from
//! the mirror, writes go to the file first and the mirror second.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ht_types::{StorageError, StorageResult, StudyHandle, StudyId, TrialRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::memory::MemoryStorage;
use crate::TrialStorage;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    StudyCreated { study: StudyHandle },
    TrialPersisted {
        study_id: StudyId,
        study: String,
        record: TrialRecord,
    },
}

/// Result of replaying a journal file.
struct Replay {
    mirror: MemoryStorage,
    /// Byte length of the prefix made of whole entries.
    valid_len: usize,
    /// The last whole entry is missing its trailing newline.
    needs_newline: bool,
}

/// File-backed trial store.
#[derive(Debug)]
pub struct JournalStorage {
    path: PathBuf,
    file: File,
    mirror: MemoryStorage,
}

impl JournalStorage {
    /// Open (or create) the journal at `path` and replay its contents.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let replayed = Self::replay(&contents)?;

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if replayed.valid_len < contents.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = contents.len() - replayed.valid_len,
                "discarding torn trailing journal line"
            );
            file.set_len(replayed.valid_len as u64)?;
        }
        if replayed.needs_newline {
            debug!(path = %path.display(), "terminating last journal line");
            file.write_all(b"\n")?;
            file.sync_data()?;
        }

        let mirror = replayed.mirror;
        info!(
            path = %path.display(),
            studies = mirror.study_names().len(),
            "opened trial journal"
        );

        Ok(Self { path, file, mirror })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild the mirror from raw journal bytes.
    ///
    /// Only an unterminated final line may fail to decode or parse; anything
    /// else is corruption.
    fn replay(contents: &[u8]) -> StorageResult<Replay> {
        let mut mirror = MemoryStorage::new();
        let mut valid_len = 0usize;
        let mut needs_newline = false;

        for (idx, line) in contents.split_inclusive(|b| *b == b'\n').enumerate() {
            let terminated = line.ends_with(b"\n");
            let corrupt = |message: String| StorageError::Corrupt {
                line: idx + 1,
                message,
            };

            let text = match std::str::from_utf8(line) {
                Ok(text) => text,
                Err(_) if !terminated => break,
                Err(e) => return Err(corrupt(e.to_string())),
            };
            let body = text.trim();
            if body.is_empty() {
                valid_len += line.len();
                continue;
            }

            let entry = match serde_json::from_str::<JournalEntry>(body) {
                Ok(entry) => entry,
                Err(_) if !terminated => break,
                Err(e) => return Err(corrupt(e.to_string())),
            };

            match entry {
                JournalEntry::StudyCreated { study } => mirror.insert_study(study),
                JournalEntry::TrialPersisted {
                    study_id,
                    study,
                    record,
                } => {
                    let handle = mirror
                        .study_handle(&study)
                        .filter(|h| h.id == study_id)
                        .ok_or_else(|| {
                            corrupt(format!(
                                "trial {} references unknown study {study}",
                                record.number
                            ))
                        })?;
                    mirror
                        .insert_trial(&handle, record)
                        .map_err(|e| corrupt(e.to_string()))?;
                }
            }
            valid_len += line.len();
            needs_newline = !terminated;
        }

        Ok(Replay {
            mirror,
            valid_len,
            needs_newline,
        })
    }

    fn append(&mut self, entry: &JournalEntry) -> StorageResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl TrialStorage for JournalStorage {
    fn create_or_load_study(&mut self, name: &str, sampler: &str) -> StorageResult<StudyHandle> {
        let (handle, created) = self.mirror.open_study(name, sampler);
        if created {
            self.append(&JournalEntry::StudyCreated {
                study: handle.clone(),
            })?;
            info!(study = %name, sampler = %sampler, "created study");
        } else {
            info!(
                study = %name,
                next_trial = handle.next_trial_number,
                "loaded existing study"
            );
        }
        Ok(handle)
    }

    fn persist_trial(&mut self, study: &StudyHandle, record: &TrialRecord) -> StorageResult<()> {
        self.mirror.check_insert(study, record)?;
        self.append(&JournalEntry::TrialPersisted {
            study_id: study.id,
            study: study.name.clone(),
            record: record.clone(),
        })?;
        self.mirror.insert_trial(study, record.clone())?;
        debug!(
            study = %study.name,
            trial = record.number,
            status = ?record.status,
            "journaled trial"
        );
        Ok(())
    }

    fn trials(&self, study: &StudyHandle) -> StorageResult<Vec<TrialRecord>> {
        self.mirror.trials(study)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ht_types::{ParameterValue, Trial, TrialStatus};

    fn complete(number: u64, value: f64) -> TrialRecord {
        let mut trial = Trial::new(number, 0);
        trial
            .parameters
            .insert("eta".into(), ParameterValue::Float(0.01));
        trial.set_attribute("best_iteration", "12");
        trial.complete(value)
    }

    #[test]
    fn journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.jsonl");

        let study = {
            let mut journal = JournalStorage::open(&path).unwrap();
            let study = journal.create_or_load_study("libffm", "adaptive").unwrap();
            journal.persist_trial(&study, &complete(0, 0.31)).unwrap();
            journal.persist_trial(&study, &complete(1, 0.27)).unwrap();
            journal.persist_trial(&study, &Trial::new(2, 0).fail()).unwrap();
            study
        };

        let mut journal = JournalStorage::open(&path).unwrap();
        let reloaded = journal.create_or_load_study("libffm", "adaptive").unwrap();
        assert_eq!(reloaded.id, study.id);
        assert_eq!(reloaded.next_trial_number, 3);

        let trials = journal.trials(&reloaded).unwrap();
        assert_eq!(trials.len(), 3);
        assert_eq!(trials[2].status, TrialStatus::Failed);

        let best = journal.query_best(&reloaded).unwrap().unwrap();
        assert_eq!(best.number, 1);
        assert_eq!(
            best.attributes.get("best_iteration").map(String::as_str),
            Some("12")
        );
    }

    #[test]
    fn torn_last_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.jsonl");

        {
            let mut journal = JournalStorage::open(&path).unwrap();
            let study = journal.create_or_load_study("s", "random").unwrap();
            journal.persist_trial(&study, &complete(0, 0.5)).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"op":"trial_persisted","study_id":"#).unwrap();
        }

        let mut journal = JournalStorage::open(&path).unwrap();
        let study = journal.create_or_load_study("s", "random").unwrap();
        assert_eq!(journal.trials(&study).unwrap().len(), 1);

        journal.persist_trial(&study, &complete(1, 0.4)).unwrap();
        drop(journal);

        let journal = JournalStorage::open(&path).unwrap();
        let contents = std::fs::read_to_string(journal.path()).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn torn_multibyte_character_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.jsonl");

        {
            let mut journal = JournalStorage::open(&path).unwrap();
            let study = journal.create_or_load_study("s", "random").unwrap();
            let mut trial = Trial::new(0, 0);
            trial.set_attribute("stdout", "entraînement terminé");
            journal.persist_trial(&study, &trial.complete(0.5)).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"op\":\"trial_persisted\",\"study\":\"caf\xc3")
                .unwrap();
        }

        let mut journal = JournalStorage::open(&path).unwrap();
        let study = journal.create_or_load_study("s", "random").unwrap();
        let trials = journal.trials(&study).unwrap();
        assert_eq!(trials.len(), 1);
        assert_eq!(
            trials[0].attributes.get("stdout").map(String::as_str),
            Some("entraînement terminé")
        );
        assert!(std::str::from_utf8(&std::fs::read(&path).unwrap()).is_ok());
    }

    #[test]
    fn invalid_utf8_inside_the_journal_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.jsonl");
        {
            let mut journal = JournalStorage::open(&path).unwrap();
            journal.create_or_load_study("s", "random").unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"\xff\xfe\n").unwrap();
        }

        match JournalStorage::open(&path) {
            Err(StorageError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn missing_final_newline_is_restored_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.jsonl");

        {
            let mut journal = JournalStorage::open(&path).unwrap();
            let study = journal.create_or_load_study("s", "random").unwrap();
            journal.persist_trial(&study, &complete(0, 0.5)).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.pop(), Some(b'\n'));
        std::fs::write(&path, &bytes).unwrap();

        {
            let mut journal = JournalStorage::open(&path).unwrap();
            let study = journal.create_or_load_study("s", "random").unwrap();
            assert_eq!(journal.trials(&study).unwrap().len(), 1);
            journal.persist_trial(&study, &complete(1, 0.4)).unwrap();
        }

        let mut journal = JournalStorage::open(&path).unwrap();
        let study = journal.create_or_load_study("s", "random").unwrap();
        assert_eq!(journal.trials(&study).unwrap().len(), 2);
        assert_eq!(study.next_trial_number, 2);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.jsonl");
        std::fs::write(&path, "not json\n{}\n").unwrap();

        match JournalStorage::open(&path) {
            Err(StorageError::Corrupt { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_trial_is_not_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.jsonl");

        let mut journal = JournalStorage::open(&path).unwrap();
        let study = journal.create_or_load_study("s", "random").unwrap();
        journal.persist_trial(&study, &complete(0, 0.5)).unwrap();
        assert!(journal.persist_trial(&study, &complete(0, 0.1)).is_err());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
