//! gRPC service feeding peer requests to the local node.

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

use crate::proto::pb;
use crate::proto::pb::raft_service_server::{RaftService, RaftServiceServer};
use crate::proto::MissingField;
use crate::raft::message::{
    AppendEntries, InstallSnapshot, RaftRequest, RaftResponse, RequestVote,
};
use crate::raft::RaftHandle;

pub struct RaftServiceSVC {
    handle: RaftHandle,
}

impl RaftServiceSVC {
    pub fn new(handle: RaftHandle) -> Self {
        RaftServiceSVC { handle }
    }

    async fn dispatch(&self, request: RaftRequest) -> Result<RaftResponse, Status> {
        let kind = request.kind();
        self.handle.handle_rpc(request).await.map_err(|e| {
            // Reported to the caller as an unreachable peer.
            log::warn!("Node declined {} request: {}", kind, e);
            Status::unavailable(e.to_string())
        })
    }
}

fn invalid(e: MissingField) -> Status {
    Status::invalid_argument(e.to_string())
}

fn mismatched(response: RaftResponse) -> Status {
    Status::internal(format!("unexpected response {:?}", response))
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn request_vote(
        &self,
        request: Request<pb::VoteRequest>,
    ) -> Result<Response<pb::VoteReply>, Status> {
        let request = RequestVote::from(request.into_inner());
        match self.dispatch(RaftRequest::RequestVote(request)).await? {
            RaftResponse::Vote(response) => Ok(Response::new(response.into())),
            other => Err(mismatched(other)),
        }
    }

    async fn append_entries(
        &self,
        request: Request<pb::AppendRequest>,
    ) -> Result<Response<pb::AppendReply>, Status> {
        let request = AppendEntries::try_from(request.into_inner()).map_err(invalid)?;
        match self.dispatch(RaftRequest::AppendEntries(request)).await? {
            RaftResponse::Append(response) => Ok(Response::new(response.into())),
            other => Err(mismatched(other)),
        }
    }

    async fn install_snapshot(
        &self,
        request: Request<pb::SnapshotRequest>,
    ) -> Result<Response<pb::AppendReply>, Status> {
        let request = InstallSnapshot::try_from(request.into_inner()).map_err(invalid)?;
        match self.dispatch(RaftRequest::InstallSnapshot(request)).await? {
            RaftResponse::Append(response) => Ok(Response::new(response.into())),
            other => Err(mismatched(other)),
        }
    }
}

/// Serves peer RPCs on `listener` until the task is aborted.
pub async fn serve(listener: TcpListener, handle: RaftHandle) -> Result<(), tonic::transport::Error> {
    tonic::transport::Server::builder()
        .add_service(RaftServiceServer::new(RaftServiceSVC::new(handle)))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
}
