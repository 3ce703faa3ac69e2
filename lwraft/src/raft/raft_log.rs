//! The node's view of its replicated log.

use crate::raft::entry::{LogEntry, Snapshot};
use crate::raft::error::StorageError;
use crate::raft::storage::LogStore;

/// Wraps a [`LogStore`] and refuses operations that would touch the applied
/// prefix of the log.
pub struct RaftLog<S: LogStore> {
    store: S,
    applied: u64,
}

impl<S: LogStore> RaftLog<S> {
    pub fn new(store: S, applied: u64) -> Self {
        RaftLog { store, applied }
    }

    pub fn set_applied(&mut self, applied: u64) {
        self.applied = applied;
    }

    pub fn first_index(&self) -> u64 {
        self.store.first_index()
    }

    pub fn boundary(&self) -> (u64, u64) {
        self.store.boundary()
    }

    pub fn last_index(&self) -> u64 {
        self.store.last_index()
    }

    pub fn last_term(&self) -> u64 {
        self.store.last_term()
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.store.term_at(index)
    }

    pub fn entry(&self, index: u64) -> Option<LogEntry> {
        self.store.entry(index)
    }

    pub fn entries(&self, from: u64, max: usize) -> Vec<LogEntry> {
        self.store.entries(from, max)
    }

    /// Whether a log ending at (`last_index`, `last_term`) is at least as
    /// up-to-date as this one.
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let our_term = self.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_index())
    }

    /// Position of the first entry that is missing locally or conflicts with
    /// the local entry at the same index.
    pub fn find_conflict(&self, entries: &[LogEntry]) -> Option<usize> {
        entries
            .iter()
            .position(|e| self.term_at(e.index) != Some(e.term))
    }

    pub fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.store.append(entries)
    }

    pub fn truncate_suffix(&mut self, from: u64) -> Result<(), StorageError> {
        if from <= self.applied {
            return Err(StorageError::InvalidIndex {
                index: from,
                reason: "cannot truncate applied entries",
            });
        }
        self.store.truncate_suffix(from)
    }

    pub fn compact_prefix(&mut self, upto: u64) -> Result<(), StorageError> {
        if upto > self.applied {
            return Err(StorageError::InvalidIndex {
                index: upto,
                reason: "cannot compact entries that are not applied",
            });
        }
        self.store.compact_prefix(upto)
    }

    /// Drops the whole log in favour of a snapshot ending at (`index`, `term`).
    pub fn reset(&mut self, index: u64, term: u64) -> Result<(), StorageError> {
        self.store.reset(index, term)
    }

    pub fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.store.save_snapshot(snapshot)
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        self.store.load_snapshot()
    }
}
