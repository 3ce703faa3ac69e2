//! Raft client implementation
//!
//! Sends consensus RPCs to peer nodes over gRPC. One lazily connected channel
//! is kept per peer and reconnects on its own after failures.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use crate::proto::pb;
use crate::proto::pb::raft_service_client::RaftServiceClient;
use crate::raft::error::TransportError;
use crate::raft::membership::Member;
use crate::raft::message::{RaftRequest, RaftResponse};
use crate::raft::transport::Transport;
use crate::raft::NodeId;

/// Client for managing connections to all peer nodes
pub struct GrpcTransport {
    max_message_bytes: usize,
    peers: Mutex<HashMap<NodeId, (String, RaftServiceClient<Channel>)>>,
}

impl GrpcTransport {
    pub fn new(max_message_bytes: usize) -> Self {
        GrpcTransport {
            max_message_bytes,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// The client for `peer`, replaced when the peer's address changed.
    fn client(&self, peer: &Member) -> Result<RaftServiceClient<Channel>, TransportError> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((addr, client)) = peers.get(&peer.id) {
            if *addr == peer.addr {
                return Ok(client.clone());
            }
        }
        let endpoint = Endpoint::from_shared(format!("http://{}", peer.addr)).map_err(|e| {
            TransportError::Codec {
                peer: peer.id,
                reason: format!("invalid address {}: {}", peer.addr, e),
            }
        })?;
        let client = RaftServiceClient::new(endpoint.tcp_nodelay(true).connect_lazy());
        peers.insert(peer.id, (peer.addr.clone(), client.clone()));
        Ok(client)
    }

    fn check_size(&self, message: &impl Message) -> Result<(), TransportError> {
        let len = message.encoded_len();
        if len > self.max_message_bytes {
            return Err(TransportError::FrameTooLarge(len));
        }
        Ok(())
    }

    async fn call(&self, peer: &Member, request: RaftRequest) -> Result<RaftResponse, TransportError> {
        let mut client = self.client(peer)?;
        let result = match request {
            RaftRequest::RequestVote(request) => client
                .request_vote(pb::VoteRequest::from(request))
                .await
                .map(|reply| RaftResponse::Vote(reply.into_inner().into())),
            RaftRequest::AppendEntries(request) => {
                let request = pb::AppendRequest::from(request);
                self.check_size(&request)?;
                client
                    .append_entries(request)
                    .await
                    .map(|reply| RaftResponse::Append(reply.into_inner().into()))
            }
            RaftRequest::InstallSnapshot(request) => {
                let request = pb::SnapshotRequest::from(request);
                self.check_size(&request)?;
                client
                    .install_snapshot(request)
                    .await
                    .map(|reply| RaftResponse::Append(reply.into_inner().into()))
            }
        };
        result.map_err(|status| status_error(peer.id, status))
    }
}

fn status_error(peer: NodeId, status: Status) -> TransportError {
    match status.code() {
        Code::InvalidArgument | Code::Internal => TransportError::Codec {
            peer,
            reason: status.message().to_string(),
        },
        _ => {
            log::debug!("RPC to peer {} failed: {}", peer, status);
            TransportError::Unreachable(peer)
        }
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn send(
        &self,
        peer: &Member,
        request: RaftRequest,
        timeout: Duration,
    ) -> Result<RaftResponse, TransportError> {
        tokio::time::timeout(timeout, self.call(peer, request))
            .await
            .map_err(|_| TransportError::Unreachable(peer.id))?
    }
}
