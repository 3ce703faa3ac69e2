//! Peer transport abstraction and an in-process implementation for tests and
//! single-process clusters.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::raft::error::TransportError;
use crate::raft::handle::RaftHandle;
use crate::raft::membership::Member;
use crate::raft::message::{
    AppendEntries, AppendResponse, InstallSnapshot, RaftRequest, RaftResponse, RequestVote,
    VoteResponse,
};
use crate::raft::NodeId;

/// Point-to-point RPC to other cluster members.
///
/// Every failure, including a timeout, is reported as an error and never as a
/// rejection; the consensus core treats them all as an unreachable peer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        peer: &Member,
        request: RaftRequest,
        timeout: Duration,
    ) -> Result<RaftResponse, TransportError>;

    async fn request_vote(
        &self,
        peer: &Member,
        request: RequestVote,
        timeout: Duration,
    ) -> Result<VoteResponse, TransportError> {
        match self.send(peer, RaftRequest::RequestVote(request), timeout).await? {
            RaftResponse::Vote(response) => Ok(response),
            other => Err(unexpected(peer.id, &other)),
        }
    }

    async fn append_entries(
        &self,
        peer: &Member,
        request: AppendEntries,
        timeout: Duration,
    ) -> Result<AppendResponse, TransportError> {
        match self.send(peer, RaftRequest::AppendEntries(request), timeout).await? {
            RaftResponse::Append(response) => Ok(response),
            other => Err(unexpected(peer.id, &other)),
        }
    }

    async fn install_snapshot(
        &self,
        peer: &Member,
        request: InstallSnapshot,
        timeout: Duration,
    ) -> Result<AppendResponse, TransportError> {
        match self.send(peer, RaftRequest::InstallSnapshot(request), timeout).await? {
            RaftResponse::Append(response) => Ok(response),
            other => Err(unexpected(peer.id, &other)),
        }
    }
}

fn unexpected(peer: NodeId, response: &RaftResponse) -> TransportError {
    TransportError::Codec {
        peer,
        reason: format!("unexpected response {:?}", response),
    }
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, RaftHandle>,
    isolated: HashSet<NodeId>,
    /// Partition group of each node; empty when the network is whole.
    groups: HashMap<NodeId, usize>,
}

impl NetworkState {
    fn connected(&self, from: NodeId, to: NodeId) -> bool {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return false;
        }
        if self.groups.is_empty() {
            return true;
        }
        matches!((self.groups.get(&from), self.groups.get(&to)), (Some(a), Some(b)) if a == b)
    }
}

/// Routes requests between nodes of one process, with controls to cut links.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: NodeId, handle: RaftHandle) {
        self.state().nodes.insert(id, handle);
    }

    /// Removes a node, as if its process had crashed.
    pub fn unregister(&self, id: NodeId) {
        self.state().nodes.remove(&id);
    }

    /// A transport that sends on behalf of `from`.
    pub fn transport(&self, from: NodeId) -> LocalTransport {
        LocalTransport {
            from,
            network: self.clone(),
        }
    }

    /// Cuts every link of `id`.
    pub fn isolate(&self, id: NodeId) {
        self.state().isolated.insert(id);
    }

    /// Splits the network so nodes only reach others in the same group. Nodes
    /// missing from every group are unreachable.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut state = self.state();
        state.groups = groups
            .iter()
            .enumerate()
            .flat_map(|(group, ids)| ids.iter().map(move |id| (*id, group)))
            .collect();
    }

    /// Restores every link.
    pub fn heal(&self) {
        let mut state = self.state();
        state.isolated.clear();
        state.groups.clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Option<RaftHandle> {
        let state = self.state();
        if !state.connected(from, to) {
            return None;
        }
        state.nodes.get(&to).cloned()
    }

    async fn call(
        &self,
        from: NodeId,
        to: NodeId,
        request: RaftRequest,
        timeout: Duration,
    ) -> Result<RaftResponse, TransportError> {
        let handle = self
            .route(from, to)
            .ok_or(TransportError::Unreachable(to))?;
        let response = tokio::time::timeout(timeout, handle.handle_rpc(request))
            .await
            .map_err(|_| TransportError::Unreachable(to))??;
        // The link may have been cut while the request was in flight.
        if !self.state().connected(from, to) {
            return Err(TransportError::Unreachable(to));
        }
        Ok(response)
    }
}

pub struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(
        &self,
        peer: &Member,
        request: RaftRequest,
        timeout: Duration,
    ) -> Result<RaftResponse, TransportError> {
        self.network.call(self.from, peer.id, request, timeout).await
    }
}
