//! Apply sink backed by an append-only journal of applied entries.
//!
//! The journal uses the same length-prefixed records as the log segments,
//! each holding a bincode `LogEntry`. A torn record at the tail is cut off
//! when the journal is opened.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::raft::entry::{LogEntry, SnapshotMeta};
use crate::raft::error::{ApplyError, StorageError};
use crate::raft::record::{self, Records};
use crate::raft::storage::write_atomic;
use crate::raft::ApplySink;

const JOURNAL_FILE: &str = "applied.journal";

pub struct JournalSink {
    dir: PathBuf,
    file: File,
    last_applied: u64,
}

struct Scan {
    last_index: u64,
    valid_len: usize,
}

/// Walks the records in `data`, stopping at the first incomplete one.
fn scan(data: &[u8]) -> Result<Scan, StorageError> {
    let mut records = Records::new(data);
    let mut last_index = 0;
    for body in records.by_ref() {
        let entry: LogEntry = bincode::deserialize(body)?;
        if entry.index <= last_index {
            return Err(StorageError::Corrupt(format!(
                "journal entry {} follows {}",
                entry.index, last_index
            )));
        }
        last_index = entry.index;
    }
    Ok(Scan {
        last_index,
        valid_len: records.consumed(),
    })
}

impl JournalSink {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(JOURNAL_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let scan = scan(&data)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if scan.valid_len < data.len() {
            log::warn!(
                "Dropping {} torn bytes at the end of {}",
                data.len() - scan.valid_len,
                path.display()
            );
            file.set_len(scan.valid_len as u64)?;
            file.sync_all()?;
        }
        Ok(JournalSink {
            dir,
            file,
            last_applied: scan.last_index,
        })
    }

    fn write_record(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        let body = bincode::serialize(entry)?;
        let mut buf = Vec::with_capacity(record::LEN_BYTES + body.len());
        record::put(&mut buf, &body);
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_journal(&self) -> Result<Vec<u8>, StorageError> {
        let mut data = Vec::new();
        File::open(self.dir.join(JOURNAL_FILE))?.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl ApplySink for JournalSink {
    fn apply(&mut self, entry: LogEntry) -> Result<(), ApplyError> {
        if entry.index <= self.last_applied {
            return Ok(());
        }
        let index = entry.index;
        self.write_record(&entry)
            .map_err(|e| ApplyError::new(index, e.to_string()))?;
        self.last_applied = index;
        Ok(())
    }

    fn last_applied_index(&self) -> u64 {
        self.last_applied
    }

    fn snapshot(&self) -> Result<Bytes, ApplyError> {
        self.read_journal()
            .map(Bytes::from)
            .map_err(|e| ApplyError::new(self.last_applied, e.to_string()))
    }

    fn restore(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<(), ApplyError> {
        let fail = |e: StorageError| ApplyError::new(meta.last_index, e.to_string());
        let scan = scan(data).map_err(fail)?;
        if scan.valid_len != data.len() || scan.last_index != meta.last_index {
            return Err(ApplyError::new(
                meta.last_index,
                format!("snapshot journal ends at {}", scan.last_index),
            ));
        }
        write_atomic(&self.dir, JOURNAL_FILE, data).map_err(fail)?;
        self.file = OpenOptions::new()
            .append(true)
            .open(self.dir.join(JOURNAL_FILE))
            .map_err(|e| fail(e.into()))?;
        self.last_applied = scan.last_index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::membership::{ClusterConfig, Member};
    use tempfile::tempdir;

    /// Mutation payloads recorded in the journal under `dir`.
    fn journal_mutations(dir: &Path) -> Vec<Bytes> {
        let data = fs::read(dir.join(JOURNAL_FILE)).unwrap();
        Records::new(&data)
            .map(|body| bincode::deserialize::<LogEntry>(body).unwrap())
            .filter_map(|entry| entry.mutation_data().cloned())
            .collect()
    }

    fn meta(last_index: u64) -> SnapshotMeta {
        SnapshotMeta {
            last_index,
            last_term: 1,
            config: ClusterConfig::bootstrap(vec![Member::new(1, "a")]),
        }
    }

    #[test]
    fn reopen_resumes_after_last_record() {
        let dir = tempdir().unwrap();
        {
            let mut sink = JournalSink::open(dir.path()).unwrap();
            sink.apply(LogEntry::noop(1, 1)).unwrap();
            sink.apply(LogEntry::mutation(2, 1, "a")).unwrap();
            sink.apply(LogEntry::mutation(3, 1, "b")).unwrap();
        }
        let mut sink = JournalSink::open(dir.path()).unwrap();
        assert_eq!(sink.last_applied_index(), 3);

        // Redelivered entries are ignored.
        sink.apply(LogEntry::mutation(3, 1, "b")).unwrap();
        assert_eq!(
            journal_mutations(dir.path()),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        {
            let mut sink = JournalSink::open(dir.path()).unwrap();
            sink.apply(LogEntry::mutation(1, 1, "a")).unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(JOURNAL_FILE))
            .unwrap();
        file.write_all(&200u64.to_le_bytes()).unwrap();
        file.write_all(&[1, 2]).unwrap();
        drop(file);

        let mut sink = JournalSink::open(dir.path()).unwrap();
        assert_eq!(sink.last_applied_index(), 1);
        sink.apply(LogEntry::mutation(2, 1, "b")).unwrap();
        drop(sink);
        assert_eq!(JournalSink::open(dir.path()).unwrap().last_applied_index(), 2);
    }

    #[test]
    fn restore_replaces_the_journal() {
        let source_dir = tempdir().unwrap();
        let mut source = JournalSink::open(source_dir.path()).unwrap();
        for i in 1..=4 {
            source.apply(LogEntry::mutation(i, 1, format!("op-{}", i))).unwrap();
        }
        let data = source.snapshot().unwrap();

        let dir = tempdir().unwrap();
        let mut sink = JournalSink::open(dir.path()).unwrap();
        sink.apply(LogEntry::mutation(1, 1, "stale")).unwrap();
        sink.restore(&meta(4), &data).unwrap();
        assert_eq!(sink.last_applied_index(), 4);
        assert_eq!(journal_mutations(dir.path()).len(), 4);
        sink.apply(LogEntry::mutation(5, 2, "next")).unwrap();
        drop(sink);

        let reopened = JournalSink::open(dir.path()).unwrap();
        assert_eq!(reopened.last_applied_index(), 5);
        let mutations = journal_mutations(dir.path());
        assert_eq!(mutations.len(), 5);
        assert_eq!(mutations[0], Bytes::from_static(b"op-1"));
    }

    #[test]
    fn restore_rejects_mismatched_snapshot() {
        let dir = tempdir().unwrap();
        let mut sink = JournalSink::open(dir.path()).unwrap();
        sink.apply(LogEntry::mutation(1, 1, "a")).unwrap();
        let data = sink.snapshot().unwrap();
        assert!(sink.restore(&meta(7), &data).is_err());
        assert_eq!(sink.last_applied_index(), 1);
    }
}
