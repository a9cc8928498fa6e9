//! Raft consensus for a replicated key-value state machine.
//!
//! [`start`] recovers a node from its [`LogStorage`](rkv_storage::LogStorage)
//! and spawns its engine; the returned [`RaftHandle`] submits commits, serves
//! read-index requests and peer RPCs. Peers are reached through a
//! [`Transport`]; [`MemNetwork`] wires nodes together in one process.

pub mod config;
mod engine;
pub mod handle;
pub mod message;
mod peer;
pub mod testing;
pub mod transport;

pub use config::RaftConfig;
pub use handle::{start, NodeStatus, RaftHandle, Role, UncommittedView};
pub use message::{
    AppendRequest, AppendResponse, RaftRequest, RaftResponse, SnapshotChunk, SnapshotResponse,
    VoteRequest, VoteResponse,
};
pub use transport::{MemNetwork, MemTransport, Transport};
