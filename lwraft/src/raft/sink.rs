use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::raft::entry::{LogEntry, SnapshotMeta};
use crate::raft::error::ApplyError;
use crate::raft::ApplySink;

#[derive(Debug, Default)]
struct Applied {
    entries: Vec<LogEntry>,
    last_applied: u64,
    fail_at: Option<u64>,
}

/// Apply sink that keeps every applied entry in memory.
///
/// Clones share the same state, so it outlives the node that feeds it and can
/// be inspected from tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Applied>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Applied> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_applied(&self) -> u64 {
        self.inner().last_applied
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner().entries.clone()
    }

    /// Payloads of the applied mutation entries, in apply order.
    pub fn mutations(&self) -> Vec<Bytes> {
        self.inner()
            .entries
            .iter()
            .filter_map(|e| e.mutation_data().cloned())
            .collect()
    }

    /// Makes the apply of `index` fail.
    pub fn fail_at(&self, index: u64) {
        self.inner().fail_at = Some(index);
    }
}

impl ApplySink for MemorySink {
    fn apply(&mut self, entry: LogEntry) -> Result<(), ApplyError> {
        let mut inner = self.inner();
        if entry.index <= inner.last_applied {
            return Ok(());
        }
        if inner.fail_at == Some(entry.index) {
            return Err(ApplyError::new(entry.index, "injected apply failure"));
        }
        if entry.index != inner.last_applied + 1 {
            return Err(ApplyError::new(
                entry.index,
                format!("expected index {}", inner.last_applied + 1),
            ));
        }
        inner.last_applied = entry.index;
        inner.entries.push(entry);
        Ok(())
    }

    fn last_applied_index(&self) -> u64 {
        self.last_applied()
    }

    fn snapshot(&self) -> Result<Bytes, ApplyError> {
        let inner = self.inner();
        bincode::serialize(&inner.entries)
            .map(Bytes::from)
            .map_err(|e| ApplyError::new(inner.last_applied, e.to_string()))
    }

    fn restore(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<(), ApplyError> {
        let entries: Vec<LogEntry> = bincode::deserialize(data)
            .map_err(|e| ApplyError::new(meta.last_index, e.to_string()))?;
        let mut inner = self.inner();
        inner.entries = entries;
        inner.last_applied = meta.last_index;
        Ok(())
    }
}
