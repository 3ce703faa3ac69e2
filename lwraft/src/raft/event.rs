use tokio::sync::oneshot;

use crate::raft::error::TransportError;
use crate::raft::message::{AppendResponse, RaftRequest, RaftResponse, VoteResponse};
use crate::raft::proposal::Proposal;
use crate::raft::NodeId;

/// Everything the control loop reacts to, besides its own timers.
pub(crate) enum Event {
    Propose(Proposal),
    /// An inbound peer RPC. Dropping `reply` tells the caller the node is
    /// unreachable.
    Rpc {
        request: RaftRequest,
        reply: oneshot::Sender<RaftResponse>,
    },
    VoteResult {
        peer: NodeId,
        term: u64,
        result: Result<VoteResponse, TransportError>,
    },
    AppendResult {
        peer: NodeId,
        term: u64,
        prev_log_index: u64,
        entries_len: u64,
        result: Result<AppendResponse, TransportError>,
    },
    SnapshotResult {
        peer: NodeId,
        term: u64,
        last_index: u64,
        result: Result<AppendResponse, TransportError>,
    },
    TriggerElection,
    Shutdown,
}
