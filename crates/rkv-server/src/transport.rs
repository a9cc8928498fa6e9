use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rkv_consensus::message::{decode_reply, RaftRequest, RaftResponse};
use rkv_consensus::Transport;
use rkv_proto::v1::{raft_service_client::RaftServiceClient, RaftMessage};
use rkv_types::{NodeId, RkvError};
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::convert::status_to_rkv;

/// Reaches other members over their cluster gRPC endpoint.
///
/// Channels are created lazily per peer and replaced when a peer's address
/// changes.
pub struct GrpcTransport {
    from: NodeId,
    connect_timeout: Duration,
    channels: Mutex<HashMap<NodeId, (String, Channel)>>,
}

impl GrpcTransport {
    pub fn new(from: NodeId, connect_timeout: Duration) -> Self {
        GrpcTransport { from, connect_timeout, channels: Mutex::new(HashMap::new()) }
    }

    fn channel(&self, target: NodeId, addr: &str) -> Result<Channel, RkvError> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((known, channel)) = channels.get(&target) {
            if known == addr {
                return Ok(channel.clone());
            }
        }
        let uri = if addr.contains("://") { addr.to_string() } else { format!("http://{addr}") };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| RkvError::InvalidArgument(format!("bad address {addr:?} for node {target}: {e}")))?
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true)
            .connect_lazy();
        debug!(target, addr, "opened channel");
        channels.insert(target, (addr.to_string(), channel.clone()));
        Ok(channel)
    }
}

impl Transport for GrpcTransport {
    async fn call(&self, target: NodeId, addr: &str, request: RaftRequest) -> Result<RaftResponse, RkvError> {
        let mut client = RaftServiceClient::new(self.channel(target, addr)?);
        let msg = RaftMessage { from: self.from, data: request.encode()? };
        let reply = match request {
            RaftRequest::Vote(_) => client.vote(msg).await,
            RaftRequest::AppendEntries(_) => client.append_entries(msg).await,
            RaftRequest::InstallSnapshot(_) => client.install_snapshot(msg).await,
            RaftRequest::ForwardCommit(_) | RaftRequest::ForwardReadIndex => client.forward(msg).await,
        }
        .map_err(status_to_rkv)?;
        decode_reply(&reply.into_inner().data)?
    }
}
