//! Single-leader consensus over a replicated log of directory mutations.

use bytes::Bytes;

pub mod config;
pub mod entry;
pub mod error;
mod event;
pub mod handle;
pub mod hard_state;
pub mod membership;
pub mod message;
pub mod node;
pub mod proposal;
mod progress;
mod raft_log;
pub(crate) mod record;
mod segment;
pub mod sink;
pub mod storage;
pub mod transport;

pub use config::RaftConfig;
pub use entry::{EntryPayload, LogEntry, Snapshot, SnapshotMeta};
pub use error::{ApplyError, RaftError, Result, StorageError, TransportError};
pub use handle::{FollowerStatus, NodeStatus, RaftHandle, Role};
pub use hard_state::{FileHardStateStore, HardState, HardStateStore, MemHardStateStore};
pub use membership::{ClusterConfig, Member, MembershipDelta};
pub use node::ConsensusNode;
pub use sink::MemorySink;
pub use storage::{FileLogStore, LogStore, MemLogStore};
pub use transport::{LocalNetwork, LocalTransport, Transport};

pub type NodeId = u64;

/// The store committed entries are applied to.
///
/// Entries arrive one at a time in strictly increasing index order. An entry
/// at or below `last_applied_index` may be delivered again after a restart and
/// must be ignored. Any error halts the node.
pub trait ApplySink: Send + 'static {
    fn apply(&mut self, entry: LogEntry) -> std::result::Result<(), ApplyError>;

    fn last_applied_index(&self) -> u64;

    /// Serializes the applied state for a snapshot.
    fn snapshot(&self) -> std::result::Result<Bytes, ApplyError>;

    /// Replaces the applied state with a snapshot covering `meta.last_index`.
    fn restore(&mut self, meta: &SnapshotMeta, data: &[u8]) -> std::result::Result<(), ApplyError>;
}
