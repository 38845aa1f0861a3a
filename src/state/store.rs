//! Durable, single-writer ledger backed by a JSONL file.
//!
//! Each record is one line, written with a single `write_all` and synced
//! before the in-memory snapshot moves. A final line with no newline is a
//! write that never finished: it is dropped on load. Any other bad line is
//! corruption.

use chrono::Utc;
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::record::{RecordKind, StateRecord};
use super::snapshot::Snapshot;
use crate::errors::{OrchestratorError, StateCorruptionError};

/// The job's record of truth.
///
/// Holding a `StateStore` opened with [`StateStore::open`] holds an exclusive
/// lock on the log file; a second orchestrator on the same log gets
/// [`OrchestratorError::Locked`].
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    file: Option<File>,
    declared: BTreeSet<String>,
    records: Vec<StateRecord>,
    snapshot: Snapshot,
}

impl StateStore {
    /// Open (or create) the log at `path`, lock it, and replay it.
    pub fn open<I, S>(path: &Path, declared: I) -> Result<Self, OrchestratorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let declared: BTreeSet<String> = declared.into_iter().map(Into::into).collect();
        let write_err = |source: std::io::Error| OrchestratorError::StateWrite {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(write_err)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                return Err(OrchestratorError::Locked(path.to_path_buf()));
            }
            return Err(write_err(e));
        }

        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|source| StateCorruptionError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;

        let parsed = parse_log(&content)?;
        if parsed.valid_len < content.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = content.len() - parsed.valid_len,
                "discarding torn final record"
            );
            file.set_len(parsed.valid_len as u64).map_err(write_err)?;
        }

        let snapshot = fold(&declared, &parsed.records)?;
        tracing::debug!(
            path = %path.display(),
            records = parsed.records.len(),
            "state log replayed"
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Some(file),
            declared,
            records: parsed.records,
            snapshot,
        })
    }

    /// A store that keeps its ledger in memory only.
    pub fn in_memory<I, S>(declared: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let declared: BTreeSet<String> = declared.into_iter().map(Into::into).collect();
        Self {
            path: None,
            file: None,
            snapshot: Snapshot::new(declared.iter().cloned()),
            declared,
            records: Vec::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Validate, persist, and fold one record.
    ///
    /// A record the fold would reject is never written.
    pub fn append(&mut self, kind: RecordKind) -> Result<StateRecord, OrchestratorError> {
        let record = StateRecord {
            seq: self.snapshot.last_seq + 1,
            at: Utc::now(),
            kind,
        };

        let mut next = self.snapshot.clone();
        next.apply(&record)?;

        if let Some(file) = self.file.as_mut() {
            let path = self.path.clone().unwrap_or_default();
            let mut line = serde_json::to_string(&record)
                .map_err(|e| OrchestratorError::Other(anyhow::Error::new(e)))?;
            line.push('\n');
            file.write_all(line.as_bytes())
                .and_then(|_| file.sync_data())
                .map_err(|source| OrchestratorError::StateWrite { path, source })?;
        }

        self.snapshot = next;
        self.records.push(record.clone());
        Ok(record)
    }

    /// Current materialized view.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn records(&self) -> &[StateRecord] {
        &self.records
    }

    /// Rebuild the snapshot from the full log.
    ///
    /// File-backed stores re-read the file; in-memory stores re-fold their
    /// records.
    pub fn replay(&self) -> Result<Snapshot, StateCorruptionError> {
        match &self.path {
            Some(path) => replay(path, self.declared.iter().cloned()),
            None => fold(&self.declared, &self.records),
        }
    }

    /// Delete the log at `path`, unless another store holds it open.
    /// Missing logs are not an error.
    pub fn reset(path: &Path) -> Result<(), OrchestratorError> {
        let write_err = |source: std::io::Error| OrchestratorError::StateWrite {
            path: path.to_path_buf(),
            source,
        };

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(write_err(e)),
        };
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                return Err(OrchestratorError::Locked(path.to_path_buf()));
            }
            return Err(write_err(e));
        }

        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(write_err(e)),
        }
    }
}

/// Fold the log at `path` into a snapshot without taking the lock.
///
/// A missing file replays to an empty snapshot.
pub fn replay<I, S>(path: &Path, declared: I) -> Result<Snapshot, StateCorruptionError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let declared: BTreeSet<String> = declared.into_iter().map(Into::into).collect();
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(StateCorruptionError::Unreadable {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let parsed = parse_log(&content)?;
    fold(&declared, &parsed.records)
}

fn fold(declared: &BTreeSet<String>, records: &[StateRecord]) -> Result<Snapshot, StateCorruptionError> {
    let mut snapshot = Snapshot::new(declared.iter().cloned());
    for record in records {
        snapshot.apply(record)?;
    }
    Ok(snapshot)
}

struct ParsedLog {
    records: Vec<StateRecord>,
    /// Byte length of the complete, newline-terminated prefix
    valid_len: usize,
}

fn parse_log(content: &str) -> Result<ParsedLog, StateCorruptionError> {
    let mut records = Vec::new();
    let mut valid_len = 0;

    for (index, line) in content.split_inclusive('\n').enumerate() {
        if !line.ends_with('\n') {
            break;
        }
        valid_len += line.len();

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: StateRecord =
            serde_json::from_str(trimmed).map_err(|e| StateCorruptionError::Malformed {
                line: index + 1,
                message: e.to_string(),
            })?;
        records.push(record);
    }

    Ok(ParsedLog { records, valid_len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseStatus;
    use crate::state::record::RecordedOutcome;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn declared() -> Vec<&'static str> {
        vec!["a", "b", "c"]
    }

    fn job_started() -> RecordKind {
        RecordKind::JobStarted {
            job_id: Uuid::nil(),
            goal: "ship".into(),
            plan_hash: "h".into(),
        }
    }

    fn started(phase: &str, attempt: u32) -> RecordKind {
        RecordKind::AttemptStarted {
            phase: phase.into(),
            attempt,
            wave: 0,
            input_digest: "d".into(),
        }
    }

    fn succeeded(phase: &str, attempt: u32) -> RecordKind {
        RecordKind::AttemptFinished {
            phase: phase.into(),
            attempt,
            outcome: RecordedOutcome::Succeeded {
                artifacts: vec![format!("{}.rs", phase)],
                decisions: vec![],
            },
        }
    }

    #[test]
    fn test_replay_matches_snapshot_at_every_crash_point() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        let kinds = vec![
            job_started(),
            started("a", 1),
            started("b", 1),
            succeeded("b", 1),
            RecordKind::AttemptFinished {
                phase: "a".into(),
                attempt: 1,
                outcome: RecordedOutcome::Failed {
                    kind: "timeout".into(),
                    detail: "attempt timed out after 1s".into(),
                },
            },
            started("a", 2),
            succeeded("a", 2),
            RecordKind::WaveCommitted {
                wave: 0,
                escalated: vec![],
            },
        ];

        let mut store = StateStore::open(&path, declared()).unwrap();
        for kind in kinds {
            store.append(kind).unwrap();
            let replayed = replay(&path, declared()).unwrap();
            assert_eq!(&replayed, store.snapshot());
        }
        assert_eq!(store.replay().unwrap(), *store.snapshot());
        assert_eq!(store.snapshot().phase("a").unwrap().attempt_count(), 2);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        {
            let mut store = StateStore::open(&path, declared()).unwrap();
            store.append(job_started()).unwrap();
            store.append(started("a", 1)).unwrap();
        }

        let mut store = StateStore::open(&path, declared()).unwrap();
        assert_eq!(store.records().len(), 2);
        assert_eq!(store.snapshot().status("a"), Some(PhaseStatus::Running));
        let record = store.append(succeeded("a", 1)).unwrap();
        assert_eq!(record.seq, 3);
    }

    #[test]
    fn test_torn_tail_is_discarded_and_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        {
            let mut store = StateStore::open(&path, declared()).unwrap();
            store.append(job_started()).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"seq":2,"at":"2026-01-01T00:00"#).unwrap();
        drop(file);

        let snapshot = replay(&path, declared()).unwrap();
        assert_eq!(snapshot.last_seq, 1);

        let mut store = StateStore::open(&path, declared()).unwrap();
        assert_eq!(store.records().len(), 1);
        store.append(started("a", 1)).unwrap();
        drop(store);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(replay(&path, declared()).is_ok());
    }

    #[test]
    fn test_malformed_middle_line_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        {
            let mut store = StateStore::open(&path, declared()).unwrap();
            store.append(job_started()).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not json\n").unwrap();
        drop(file);

        let err = replay(&path, declared()).unwrap_err();
        assert!(matches!(err, StateCorruptionError::Malformed { line: 2, .. }));
        assert!(matches!(
            StateStore::open(&path, declared()),
            Err(OrchestratorError::StateCorruption(_))
        ));
    }

    #[test]
    fn test_undeclared_phase_fails_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        {
            let mut store = StateStore::open(&path, declared()).unwrap();
            store.append(job_started()).unwrap();
            store.append(started("c", 1)).unwrap();
        }

        let err = replay(&path, ["a", "b"]).unwrap_err();
        assert!(matches!(err, StateCorruptionError::UnknownPhase { seq: 2, .. }));
    }

    #[test]
    fn test_invalid_append_is_not_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        let mut store = StateStore::open(&path, declared()).unwrap();
        store.append(job_started()).unwrap();

        let err = store.append(succeeded("a", 1)).unwrap_err();
        assert!(matches!(err, OrchestratorError::StateCorruption(_)));
        assert_eq!(store.records().len(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        let _first = StateStore::open(&path, declared()).unwrap();

        let second = StateStore::open(&path, declared());
        assert!(matches!(second, Err(OrchestratorError::Locked(_))));
    }

    #[test]
    fn test_missing_log_replays_empty() {
        let dir = tempdir().unwrap();
        let snapshot = replay(&dir.path().join("nope.jsonl"), declared()).unwrap();
        assert_eq!(snapshot.last_seq, 0);
        assert_eq!(snapshot.phases.len(), 3);
    }

    #[test]
    fn test_in_memory_store_replays_records() {
        let mut store = StateStore::in_memory(declared());
        store.append(job_started()).unwrap();
        store.append(started("b", 1)).unwrap();
        assert!(store.path().is_none());
        assert_eq!(store.replay().unwrap(), *store.snapshot());
    }

    #[test]
    fn test_reset_removes_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        std::fs::write(&path, "").unwrap();
        StateStore::reset(&path).unwrap();
        assert!(!path.exists());
        StateStore::reset(&path).unwrap();
    }

    #[test]
    fn test_reset_refuses_locked_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        let _store = StateStore::open(&path, ["a"]).unwrap();
        assert!(matches!(
            StateStore::reset(&path),
            Err(OrchestratorError::Locked(_))
        ));
        assert!(path.exists());
    }
}
