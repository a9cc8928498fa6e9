use rkv_consensus::message::{encode_reply, RaftRequest};
use rkv_consensus::RaftHandle;
use rkv_proto::v1::{raft_service_server::RaftService, RaftMessage};
use tonic::{Request, Response, Status};
use tracing::trace;

use crate::convert::rkv_to_status;

/// Receives consensus traffic from other members and hands it to the local
/// engine.
pub struct RaftServiceImpl {
    raft: RaftHandle,
}

impl RaftServiceImpl {
    pub fn new(raft: RaftHandle) -> Self {
        RaftServiceImpl { raft }
    }

    async fn dispatch(&self, request: Request<RaftMessage>, expected: &[&str]) -> Result<Response<RaftMessage>, Status> {
        let msg = request.into_inner();
        let decoded = RaftRequest::decode(&msg.data).map_err(|e| Status::invalid_argument(e.to_string()))?;
        if !expected.contains(&decoded.kind()) {
            return Err(Status::invalid_argument(format!(
                "{} request sent to the wrong method",
                decoded.kind()
            )));
        }
        trace!(from = msg.from, kind = decoded.kind(), "raft rpc");
        let reply = self.raft.handle_rpc(decoded).await;
        let data = encode_reply(&reply).map_err(rkv_to_status)?;
        Ok(Response::new(RaftMessage { from: self.raft.id(), data }))
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceImpl {
    async fn vote(&self, request: Request<RaftMessage>) -> Result<Response<RaftMessage>, Status> {
        self.dispatch(request, &["vote"]).await
    }

    async fn append_entries(&self, request: Request<RaftMessage>) -> Result<Response<RaftMessage>, Status> {
        self.dispatch(request, &["append_entries"]).await
    }

    async fn install_snapshot(&self, request: Request<RaftMessage>) -> Result<Response<RaftMessage>, Status> {
        self.dispatch(request, &["install_snapshot"]).await
    }

    async fn forward(&self, request: Request<RaftMessage>) -> Result<Response<RaftMessage>, Status> {
        self.dispatch(request, &["forward_commit", "forward_read_index"]).await
    }
}
