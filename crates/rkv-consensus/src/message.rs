use serde::{Deserialize, Serialize};

use rkv_storage::LogEntry;
use rkv_types::{ClusterConfig, CommitRequest, CommitResult, NodeId, RkvError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicates `entries` after `(prev_log_index, prev_log_term)`. An empty
/// `entries` is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// Last index known to match the leader when `success`.
    pub match_index: u64,
    /// On rejection: the follower's last index + 1 when its log is too short,
    /// otherwise the rejected `prev_log_index`.
    pub conflict_index: u64,
}

/// One piece of a snapshot transfer. Chunks are sent in order; `offset` is
/// the byte position of `data` in the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub term: u64,
    pub leader_id: NodeId,
    pub snapshot_id: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub config: ClusterConfig,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: u64,
    pub success: bool,
}

/// Everything one node may ask of another over the cluster transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    Vote(VoteRequest),
    AppendEntries(AppendRequest),
    InstallSnapshot(SnapshotChunk),
    /// A follower relaying a transaction commit to the leader.
    ForwardCommit(CommitRequest),
    /// A follower asking the leader for a linearizable read index.
    ForwardReadIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    Vote(VoteResponse),
    AppendEntries(AppendResponse),
    InstallSnapshot(SnapshotResponse),
    Commit(CommitResult),
    ReadIndex(u64),
}

impl RaftRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            RaftRequest::Vote(_) => "vote",
            RaftRequest::AppendEntries(_) => "append_entries",
            RaftRequest::InstallSnapshot(_) => "install_snapshot",
            RaftRequest::ForwardCommit(_) => "forward_commit",
            RaftRequest::ForwardReadIndex => "forward_read_index",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RkvError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RkvError> {
        decode(bytes)
    }
}

impl RaftResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            RaftResponse::Vote(_) => "vote",
            RaftResponse::AppendEntries(_) => "append_entries",
            RaftResponse::InstallSnapshot(_) => "install_snapshot",
            RaftResponse::Commit(_) => "commit",
            RaftResponse::ReadIndex(_) => "read_index",
        }
    }
}

/// Encode the outcome of handling a request. Errors travel to the caller so
/// a forwarded commit fails with the leader's own error.
pub fn encode_reply(reply: &Result<RaftResponse, RkvError>) -> Result<Vec<u8>, RkvError> {
    encode(reply)
}

pub fn decode_reply(bytes: &[u8]) -> Result<Result<RaftResponse, RkvError>, RkvError> {
    decode(bytes)
}

fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, RkvError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| RkvError::Consensus(format!("encode: {e}")))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, RkvError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| RkvError::Consensus(format!("decode: {e}")))
}
