//! Error types for each boundary of the consensus core.
//!
//! Transient failures (unreachable peers, stale terms, log inconsistencies)
//! are handled inside the control loop and never reach callers. Storage and
//! apply failures halt the node. Everything in [`RaftError`] is what a
//! proposer can observe.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::raft::NodeId;

/// Result type for caller-facing raft operations.
pub type Result<T> = std::result::Result<T, RaftError>;

/// Failures of the persistent log store and the term/vote store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),

    #[error("storage codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The index is outside the range the operation may touch.
    #[error("invalid log index {index}: {reason}")]
    InvalidIndex { index: u64, reason: &'static str },

    #[error("corrupt storage: {0}")]
    Corrupt(String),
}

/// Failures of the peer transport. Any of them means the peer could not be
/// reached in time; the consensus core decides whether to retry.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),

    #[error("peer {peer}: codec error: {reason}")]
    Codec { peer: NodeId, reason: String },

    #[error("message of {0} bytes exceeds the configured limit")]
    FrameTooLarge(usize),
}

/// Reported by the apply sink when it cannot apply committed state.
#[derive(Debug, Error)]
#[error("apply failed at index {index}: {reason}")]
pub struct ApplyError {
    pub index: u64,
    pub reason: String,
}

impl ApplyError {
    pub fn new(index: u64, reason: impl Into<String>) -> Self {
        ApplyError {
            index,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced to proposers and operators.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("not the leader, leader hint: {leader_hint:?}")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("a configuration change is still uncommitted")]
    ConfigChangeInProgress,

    #[error("invalid membership change: {0}")]
    InvalidMembershipDelta(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The node stopped participating after a local-fatal failure.
    #[error("node halted: {0}")]
    Halted(String),

    #[error("node is shut down")]
    Shutdown,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("configuration error: {0}")]
    Config(String),
}
