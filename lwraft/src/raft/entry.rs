//! Log entries and snapshots replicated by the consensus core.

use bytes::Bytes;
use serde_derive::{Deserialize, Serialize};

use crate::raft::membership::{ClusterConfig, MembershipDelta};

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by every new leader to commit entries of earlier terms.
    Noop,
    /// An already validated directory mutation, opaque to the core.
    Mutation(Bytes),
    /// A single member addition or removal.
    ConfigChange(MembershipDelta),
}

/// A single entry of the replicated log.
///
/// Entries are immutable once appended. The payload buffer is reference
/// counted, so handing an entry to the transport or to the apply sink never
/// copies the mutation bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, payload: EntryPayload) -> Self {
        LogEntry {
            index,
            term,
            payload,
        }
    }

    pub fn noop(index: u64, term: u64) -> Self {
        Self::new(index, term, EntryPayload::Noop)
    }

    pub fn mutation(index: u64, term: u64, data: impl Into<Bytes>) -> Self {
        Self::new(index, term, EntryPayload::Mutation(data.into()))
    }

    pub fn config_change(index: u64, term: u64, delta: MembershipDelta) -> Self {
        Self::new(index, term, EntryPayload::ConfigChange(delta))
    }

    /// Returns the mutation bytes, if this is a mutation entry.
    pub fn mutation_data(&self) -> Option<&Bytes> {
        match &self.payload {
            EntryPayload::Mutation(data) => Some(data),
            _ => None,
        }
    }

    pub fn membership_delta(&self) -> Option<&MembershipDelta> {
        match &self.payload {
            EntryPayload::ConfigChange(delta) => Some(delta),
            _ => None,
        }
    }
}

/// Position of a snapshot in the log and the configuration in force there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: u64,
    pub last_term: u64,
    pub config: ClusterConfig,
}

/// Apply sink state covering every entry up to `meta.last_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Bytes,
}
