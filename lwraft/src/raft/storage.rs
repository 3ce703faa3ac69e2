use crate::raft::entry::{LogEntry, Snapshot};
use crate::raft::error::StorageError;
use crate::raft::segment::Segment;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const META_FILE: &str = "log.meta";
const SNAPSHOT_FILE: &str = "snapshot";

/// Durable, append-only storage for log entries.
///
/// Implementations must make `append`, `truncate_suffix`, `compact_prefix` and
/// `reset` durable before returning. The store has a single writer: the
/// consensus loop of the node that owns it.
pub trait LogStore: Send + 'static {
    /// Index and term of the last compacted entry, (0, 0) if nothing was compacted.
    fn boundary(&self) -> (u64, u64);

    /// Index of the last entry, or the boundary index when no entries are retained.
    fn last_index(&self) -> u64;

    /// Returns the entry at `index` if it is retained.
    fn entry(&self, index: u64) -> Option<LogEntry>;

    /// Up to `max` entries starting at `from`.
    fn entries(&self, from: u64, max: usize) -> Vec<LogEntry>;

    /// Appends entries that must start at `last_index() + 1`.
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Removes every entry with index >= `from`.
    fn truncate_suffix(&mut self, from: u64) -> Result<(), StorageError>;

    /// Discards every entry with index <= `upto`.
    fn compact_prefix(&mut self, upto: u64) -> Result<(), StorageError>;

    /// Discards all entries; the next appended entry will be `index + 1`.
    fn reset(&mut self, index: u64, term: u64) -> Result<(), StorageError>;

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Index of the first retained entry.
    fn first_index(&self) -> u64 {
        self.boundary().0 + 1
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        let (prev_index, prev_term) = self.boundary();
        if index == prev_index {
            return Some(prev_term);
        }
        self.entry(index).map(|e| e.term)
    }

    fn last_term(&self) -> u64 {
        self.term_at(self.last_index()).unwrap_or(0)
    }
}

fn check_contiguous(last_index: u64, entries: &[LogEntry]) -> Result<(), StorageError> {
    let mut expected = last_index + 1;
    for entry in entries {
        if entry.index != expected {
            return Err(StorageError::InvalidIndex {
                index: entry.index,
                reason: "appended entries must continue the log without gaps",
            });
        }
        expected += 1;
    }
    Ok(())
}

/// Entries retained after a compaction boundary, shared by both stores.
#[derive(Debug, Default)]
struct RetainedLog {
    prev_index: u64,
    prev_term: u64,
    entries: VecDeque<LogEntry>,
}

impl RetainedLog {
    fn last_index(&self) -> u64 {
        self.prev_index + self.entries.len() as u64
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index <= self.prev_index || index > self.last_index() {
            return None;
        }
        Some((index - self.prev_index - 1) as usize)
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        self.offset(index).map(|i| self.entries[i].clone())
    }

    fn entries(&self, from: u64, max: usize) -> Vec<LogEntry> {
        match self.offset(from) {
            Some(start) => self.entries.iter().skip(start).take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    fn truncate_from(&mut self, from: u64) -> Result<(), StorageError> {
        if from <= self.prev_index {
            return Err(StorageError::InvalidIndex {
                index: from,
                reason: "cannot truncate compacted entries",
            });
        }
        if let Some(keep) = self.offset(from) {
            self.entries.truncate(keep);
        }
        Ok(())
    }

    /// Returns the boundary that compacting up to `upto` would produce.
    fn compaction_boundary(&self, upto: u64) -> Result<Option<(u64, u64)>, StorageError> {
        if upto <= self.prev_index {
            return Ok(None);
        }
        match self.entry(upto) {
            Some(entry) => Ok(Some((upto, entry.term))),
            None => Err(StorageError::InvalidIndex {
                index: upto,
                reason: "cannot compact beyond the last entry",
            }),
        }
    }

    fn compact_to(&mut self, upto: u64, term: u64) {
        let drop = (upto - self.prev_index) as usize;
        self.entries.drain(..drop.min(self.entries.len()));
        self.prev_index = upto;
        self.prev_term = term;
    }
}

// -- in-memory log store --

#[derive(Debug, Default)]
struct MemLog {
    log: RetainedLog,
    snapshot: Option<Snapshot>,
    fail_writes: bool,
}

impl MemLog {
    fn writable(&self) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "log store is failing writes",
            )));
        }
        Ok(())
    }
}

/// In-memory log store.
///
/// Clones share the same log, so a test can drop a node and start a new one
/// on the same "disk".
#[derive(Debug, Clone, Default)]
pub struct MemLogStore {
    inner: Arc<Mutex<MemLog>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail with an I/O error, or stop failing.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner().fail_writes = fail;
    }

    fn inner(&self) -> MutexGuard<'_, MemLog> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogStore for MemLogStore {
    fn boundary(&self) -> (u64, u64) {
        let inner = self.inner();
        (inner.log.prev_index, inner.log.prev_term)
    }

    fn last_index(&self) -> u64 {
        self.inner().log.last_index()
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        self.inner().log.entry(index)
    }

    fn entries(&self, from: u64, max: usize) -> Vec<LogEntry> {
        self.inner().log.entries(from, max)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut inner = self.inner();
        inner.writable()?;
        check_contiguous(inner.log.last_index(), entries)?;
        inner.log.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_suffix(&mut self, from: u64) -> Result<(), StorageError> {
        let mut inner = self.inner();
        inner.writable()?;
        inner.log.truncate_from(from)
    }

    fn compact_prefix(&mut self, upto: u64) -> Result<(), StorageError> {
        let mut inner = self.inner();
        inner.writable()?;
        if let Some((index, term)) = inner.log.compaction_boundary(upto)? {
            inner.log.compact_to(index, term);
        }
        Ok(())
    }

    fn reset(&mut self, index: u64, term: u64) -> Result<(), StorageError> {
        let mut inner = self.inner();
        inner.writable()?;
        inner.log = RetainedLog {
            prev_index: index,
            prev_term: term,
            entries: VecDeque::new(),
        };
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut inner = self.inner();
        inner.writable()?;
        inner.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.inner().snapshot.clone())
    }
}

// -- segment file log store --

#[derive(Debug, Default, Serialize, Deserialize)]
struct LogMeta {
    prev_index: u64,
    prev_term: u64,
}

/// Log store backed by `segment_<start>.log` files under `base_path`.
///
/// Every retained entry is mirrored in memory; the segments are only read
/// when the store is opened.
pub struct FileLogStore {
    base_path: PathBuf,
    segment_entries: usize,
    segments: BTreeMap<u64, Segment>,
    log: RetainedLog,
}

impl FileLogStore {
    pub fn open<P: AsRef<Path>>(base_path: P, segment_entries: usize) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let meta = read_meta(&base_path)?;
        let mut log = RetainedLog {
            prev_index: meta.prev_index,
            prev_term: meta.prev_term,
            entries: VecDeque::new(),
        };

        // Find all segment files, ordered by start index
        let mut segment_files = BTreeMap::new();
        for dir_entry in fs::read_dir(&base_path)? {
            let path = dir_entry?.path();
            if let Some(start_index) = segment_start(&path) {
                segment_files.insert(start_index, path);
            }
        }

        let mut segments = BTreeMap::new();
        for (start_index, path) in segment_files {
            let mut segment = Segment::open(&path, start_index)?;

            // Left behind by a compaction interrupted after the boundary was written
            if segment.end_index() <= log.prev_index {
                segment.remove()?;
                continue;
            }

            for (offset, record) in segment.read_all()?.into_iter().enumerate() {
                let entry: LogEntry = bincode::deserialize(&record)?;
                if entry.index != start_index + offset as u64 {
                    return Err(StorageError::Corrupt(format!(
                        "{} holds index {} at offset {}",
                        path.display(),
                        entry.index,
                        offset
                    )));
                }
                if entry.index <= log.prev_index {
                    continue;
                }
                if entry.index != log.last_index() + 1 {
                    return Err(StorageError::Corrupt(format!(
                        "gap in log before index {} in {}",
                        entry.index,
                        path.display()
                    )));
                }
                log.entries.push_back(entry);
            }
            segments.insert(start_index, segment);
        }

        Ok(FileLogStore {
            base_path,
            segment_entries: segment_entries.max(1),
            segments,
            log,
        })
    }

    fn segment_path(&self, start_index: u64) -> PathBuf {
        self.base_path.join(format!("segment_{}.log", start_index))
    }

    fn write_meta(&self, prev_index: u64, prev_term: u64) -> Result<(), StorageError> {
        let meta = LogMeta {
            prev_index,
            prev_term,
        };
        write_atomic(&self.base_path, META_FILE, &bincode::serialize(&meta)?)
    }

    /// Deletes every segment, newest first, so an interruption leaves a
    /// prefix of the log behind.
    fn remove_segments(&mut self) -> Result<(), StorageError> {
        let starts: Vec<u64> = self.segments.keys().rev().copied().collect();
        for start in starts {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        sync_dir(&self.base_path)
    }

    /// The segment new entries go to, rolling over when the active one is full.
    fn active_segment(&mut self, next_index: u64) -> Result<&mut Segment, StorageError> {
        let roll = match self.segments.values().next_back() {
            Some(segment) => {
                segment.len() >= self.segment_entries || segment.end_index() + 1 != next_index
            }
            None => true,
        };
        if roll {
            let segment = Segment::open(self.segment_path(next_index), next_index)?;
            sync_dir(&self.base_path)?;
            self.segments.insert(next_index, segment);
        }
        self.segments
            .values_mut()
            .next_back()
            .ok_or_else(|| StorageError::Corrupt("no active segment".to_string()))
    }
}

impl LogStore for FileLogStore {
    fn boundary(&self) -> (u64, u64) {
        (self.log.prev_index, self.log.prev_term)
    }

    fn last_index(&self) -> u64 {
        self.log.last_index()
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        self.log.entry(index)
    }

    fn entries(&self, from: u64, max: usize) -> Vec<LogEntry> {
        self.log.entries(from, max)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        check_contiguous(self.log.last_index(), entries)?;

        let mut written = 0;
        while written < entries.len() {
            let next_index = entries[written].index;
            let segment_entries = self.segment_entries;
            let segment = self.active_segment(next_index)?;
            let take = (segment_entries - segment.len()).min(entries.len() - written);
            let records = entries[written..written + take]
                .iter()
                .map(bincode::serialize)
                .collect::<Result<Vec<_>, _>>()?;
            segment.append(&records)?;
            written += take;
        }

        self.log.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_suffix(&mut self, from: u64) -> Result<(), StorageError> {
        if from > self.log.last_index() {
            return Ok(());
        }
        self.log.truncate_from(from)?;

        let doomed: Vec<u64> = self.segments.range(from..).map(|(start, _)| *start).collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        if let Some(segment) = self.segments.values_mut().next_back() {
            segment.truncate_from(from)?;
        }
        Ok(())
    }

    fn compact_prefix(&mut self, upto: u64) -> Result<(), StorageError> {
        let (index, term) = match self.log.compaction_boundary(upto)? {
            Some(boundary) => boundary,
            None => return Ok(()),
        };

        // The boundary must be durable before any segment disappears.
        self.write_meta(index, term)?;
        self.log.compact_to(index, term);

        let covered: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, segment)| segment.end_index() <= index)
            .map(|(start, _)| *start)
            .collect();
        for start in covered {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        Ok(())
    }

    fn reset(&mut self, index: u64, term: u64) -> Result<(), StorageError> {
        // The new boundary must never land in front of entries of the old log.
        self.remove_segments()?;
        self.write_meta(index, term)?;
        self.log = RetainedLog {
            prev_index: index,
            prev_term: term,
            entries: VecDeque::new(),
        };
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        write_atomic(&self.base_path, SNAPSHOT_FILE, &bincode::serialize(snapshot)?)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        let path = self.base_path.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Ok(Some(bincode::deserialize(&data)?))
    }
}

fn segment_start(path: &Path) -> Option<u64> {
    if !path.is_file() {
        return None;
    }
    path.file_name()?
        .to_str()?
        .strip_prefix("segment_")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

fn read_meta(base_path: &Path) -> Result<LogMeta, StorageError> {
    let path = base_path.join(META_FILE);
    if !path.exists() {
        return Ok(LogMeta::default());
    }
    Ok(bincode::deserialize(&fs::read(path)?)?)
}

/// Writes `name` under `dir` through a temporary file, fsync and rename.
pub(crate) fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<(), StorageError> {
    let temp_path = dir.join(format!("{}.tmp", name));
    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    sync_dir(dir)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StorageError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::entry::SnapshotMeta;
    use crate::raft::membership::{ClusterConfig, Member};
    use tempfile::tempdir;

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
        range
            .map(|i| LogEntry::mutation(i, term, format!("op-{}", i).into_bytes()))
            .collect()
    }

    #[test]
    fn empty_log_reports_zero() {
        let store = MemLogStore::new();
        assert_eq!(store.last_index(), 0);
        assert_eq!(store.last_term(), 0);
        assert_eq!(store.term_at(0), Some(0));
        assert_eq!(store.entry(1), None);
    }

    #[test]
    fn mem_store_rejects_gaps() {
        let mut store = MemLogStore::new();
        store.append(&entries(1..=2, 1)).unwrap();
        let err = store.append(&entries(4..=4, 1)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidIndex { index: 4, .. }));
    }

    #[test]
    fn mem_store_clones_share_state() {
        let mut store = MemLogStore::new();
        let restarted = store.clone();
        store.append(&entries(1..=3, 2)).unwrap();
        assert_eq!(restarted.last_index(), 3);
        assert_eq!(restarted.last_term(), 2);
    }

    #[test]
    fn mem_store_compacts_and_truncates() {
        let mut store = MemLogStore::new();
        store.append(&entries(1..=5, 1)).unwrap();
        store.compact_prefix(2).unwrap();
        assert_eq!(store.first_index(), 3);
        assert_eq!(store.term_at(2), Some(1));
        assert_eq!(store.entry(2), None);

        assert!(store.truncate_suffix(2).is_err());
        store.truncate_suffix(4).unwrap();
        assert_eq!(store.last_index(), 3);
        assert!(store.compact_prefix(9).is_err());
    }

    #[test]
    fn mem_store_can_fail_writes() {
        let mut store = MemLogStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.append(&entries(1..=1, 1)),
            Err(StorageError::Io(_))
        ));
        store.set_fail_writes(false);
        store.append(&entries(1..=1, 1)).unwrap();
    }

    #[test]
    fn file_store_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileLogStore::open(dir.path(), 4).unwrap();
            store.append(&entries(1..=6, 1)).unwrap();
            store.append(&entries(7..=10, 2)).unwrap();
        }
        let store = FileLogStore::open(dir.path(), 4).unwrap();
        assert_eq!(store.last_index(), 10);
        assert_eq!(store.last_term(), 2);
        assert_eq!(store.entries(5, 3), entries(5..=6, 1).into_iter().chain(entries(7..=7, 2)).collect::<Vec<_>>());
    }

    #[test]
    fn file_store_truncates_across_segments() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileLogStore::open(dir.path(), 3).unwrap();
            store.append(&entries(1..=8, 1)).unwrap();
            store.truncate_suffix(3).unwrap();
            assert_eq!(store.last_index(), 2);
            store.append(&entries(3..=4, 5)).unwrap();
        }
        let store = FileLogStore::open(dir.path(), 3).unwrap();
        assert_eq!(store.last_index(), 4);
        assert_eq!(store.term_at(2), Some(1));
        assert_eq!(store.term_at(3), Some(5));
        assert_eq!(store.term_at(4), Some(5));
    }

    #[test]
    fn file_store_compaction_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileLogStore::open(dir.path(), 2).unwrap();
            store.append(&entries(1..=7, 3)).unwrap();
            store.compact_prefix(5).unwrap();
            assert_eq!(store.first_index(), 6);
        }
        let mut store = FileLogStore::open(dir.path(), 2).unwrap();
        assert_eq!(store.boundary(), (5, 3));
        assert_eq!(store.entry(5), None);
        assert_eq!(store.last_index(), 7);
        store.append(&entries(8..=8, 3)).unwrap();
        assert_eq!(store.last_index(), 8);
    }

    #[test]
    fn file_store_reset_and_snapshot() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_index: 20,
                last_term: 4,
                config: ClusterConfig::bootstrap(vec![Member::new(1, "127.0.0.1:4001")]),
            },
            data: bytes::Bytes::from_static(b"state"),
        };
        {
            let mut store = FileLogStore::open(dir.path(), 4).unwrap();
            store.append(&entries(1..=3, 1)).unwrap();
            store.save_snapshot(&snapshot).unwrap();
            store.reset(20, 4).unwrap();
            assert_eq!(store.last_index(), 20);
            store.append(&entries(21..=21, 4)).unwrap();
        }
        let store = FileLogStore::open(dir.path(), 4).unwrap();
        assert_eq!(store.load_snapshot().unwrap(), Some(snapshot));
        assert_eq!(store.boundary(), (20, 4));
        assert_eq!(store.last_index(), 21);
        assert_eq!(store.entry(3), None);
    }

    #[test]
    fn interrupted_reset_leaves_a_prefix_of_the_old_log() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileLogStore::open(dir.path(), 3).unwrap();
            store.append(&entries(1..=8, 1)).unwrap();
        }
        // Only the newest segment was gone when the process died.
        fs::remove_file(dir.path().join("segment_7.log")).unwrap();
        {
            let mut store = FileLogStore::open(dir.path(), 3).unwrap();
            assert_eq!(store.boundary(), (0, 0));
            assert_eq!(store.last_index(), 6);
            // Every segment removed, the boundary not yet written.
            store.remove_segments().unwrap();
        }
        let store = FileLogStore::open(dir.path(), 3).unwrap();
        assert_eq!(store.boundary(), (0, 0));
        assert_eq!(store.last_index(), 0);
    }
}
