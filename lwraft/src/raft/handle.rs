//! The cloneable front door of a running consensus node.

use std::time::Duration;

use bytes::Bytes;
use serde_derive::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::raft::error::{RaftError, Result, TransportError};
use crate::raft::event::Event;
use crate::raft::membership::MembershipDelta;
use crate::raft::message::{RaftRequest, RaftResponse};
use crate::raft::proposal::Proposal;
use crate::raft::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    /// Numeric value exported as the `raft_role` gauge.
    pub fn code(&self) -> i64 {
        match self {
            Role::Follower => 0,
            Role::Candidate => 1,
            Role::Leader => 2,
        }
    }
}

/// Replication state of one follower as seen by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowerStatus {
    pub id: NodeId,
    pub match_index: u64,
    pub next_index: u64,
    /// The last AppendEntries or InstallSnapshot sent to it was answered.
    pub reachable: bool,
}

/// Snapshot of a node's state, published after every control-loop step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub members: Vec<NodeId>,
    /// The node leads and has committed an entry of its own term.
    pub leader_ready: bool,
    pub halted: Option<String>,
    /// Filled in on the leader only.
    pub followers: Vec<FollowerStatus>,
}

impl NodeStatus {
    pub(crate) fn initial(id: NodeId) -> Self {
        NodeStatus {
            id,
            role: Role::Follower,
            term: 0,
            leader: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            members: Vec::new(),
            leader_ready: false,
            halted: None,
            followers: Vec::new(),
        }
    }
}

/// Handle to a running node. Every call goes through the node's event queue;
/// none of them blocks the control loop.
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    events: mpsc::Sender<Event>,
    status: watch::Receiver<NodeStatus>,
}

impl RaftHandle {
    pub(crate) fn new(id: NodeId, events: mpsc::Sender<Event>, status: watch::Receiver<NodeStatus>) -> Self {
        RaftHandle { id, events, status }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every published status.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.status.borrow().leader
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().role == Role::Leader
    }

    /// Commit index a linearizable read may be served at, available once this
    /// node leads and has committed its first entry of the term.
    pub fn read_index(&self) -> Result<u64> {
        let status = self.status.borrow();
        if let Some(reason) = &status.halted {
            return Err(RaftError::Halted(reason.clone()));
        }
        if status.leader_ready {
            Ok(status.commit_index)
        } else {
            Err(RaftError::NotLeader {
                leader_hint: status.leader.filter(|id| *id != self.id),
            })
        }
    }

    /// Appends a mutation to the log and returns its index. Fails fast with
    /// `NotLeader` on any node other than the leader.
    pub async fn propose(&self, data: impl Into<Bytes>) -> Result<u64> {
        self.check_leader()?;
        let (proposal, rx) = Proposal::mutation(data.into());
        self.submit(proposal, rx).await
    }

    /// Appends a single membership change and returns its index.
    pub async fn propose_config_change(&self, delta: MembershipDelta) -> Result<u64> {
        self.check_leader()?;
        let (proposal, rx) = Proposal::config_change(delta);
        self.submit(proposal, rx).await
    }

    /// Waits until the entry at `index` has been applied on this node.
    pub async fn wait_applied(&self, index: u64, timeout: Duration) -> Result<()> {
        let mut status = self.subscribe();
        let wait = async move {
            loop {
                {
                    let current = status.borrow_and_update();
                    if current.last_applied >= index {
                        return Ok(());
                    }
                    if let Some(reason) = &current.halted {
                        return Err(RaftError::Halted(reason.clone()));
                    }
                }
                if status.changed().await.is_err() {
                    return Err(RaftError::Shutdown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RaftError::Timeout(timeout))?
    }

    /// Delivers an inbound peer request and waits for the node's answer.
    pub async fn handle_rpc(&self, request: RaftRequest) -> std::result::Result<RaftResponse, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Rpc { request, reply })
            .await
            .map_err(|_| TransportError::Unreachable(self.id))?;
        rx.await.map_err(|_| TransportError::Unreachable(self.id))
    }

    /// Makes this node campaign now, overriding leader stickiness on its peers.
    pub async fn trigger_election(&self) -> Result<()> {
        self.events
            .send(Event::TriggerElection)
            .await
            .map_err(|_| RaftError::Shutdown)
    }

    pub async fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown).await;
    }

    fn check_leader(&self) -> Result<()> {
        let status = self.status.borrow();
        if let Some(reason) = &status.halted {
            return Err(RaftError::Halted(reason.clone()));
        }
        if status.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: status.leader,
            });
        }
        Ok(())
    }

    async fn submit(&self, proposal: Proposal, rx: oneshot::Receiver<Result<u64>>) -> Result<u64> {
        self.events
            .send(Event::Propose(proposal))
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }
}
