use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};

use tracing::trace;

use rkv_types::{NodeId, RkvError};

use crate::handle::RaftHandle;
use crate::message::{RaftRequest, RaftResponse};

/// Delivers requests to other cluster members.
///
/// Implementations report a peer they cannot reach as
/// [`RkvError::Unreachable`]; the engine bounds every call with its own
/// deadline, so a transport does not need one.
pub trait Transport: Send + Sync + 'static {
    fn call(
        &self,
        target: NodeId,
        addr: &str,
        request: RaftRequest,
    ) -> impl Future<Output = Result<RaftResponse, RkvError>> + Send;
}

// ---------------------------------------------------------------------------
// In-process network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NetState {
    nodes: HashMap<NodeId, RaftHandle>,
    isolated: HashSet<NodeId>,
    /// Nodes on the far side of a partition. Unlisted nodes are in group 0.
    groups: HashMap<NodeId, u32>,
}

impl NetState {
    fn connected(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        let group = |id: NodeId| self.groups.get(&id).copied().unwrap_or(0);
        !self.isolated.contains(&a) && !self.isolated.contains(&b) && group(a) == group(b)
    }
}

/// A set of nodes in one process that talk through direct handle calls,
/// with switches for cutting them apart.
#[derive(Clone, Default)]
pub struct MemNetwork {
    state: Arc<RwLock<NetState>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        MemNetwork::default()
    }

    /// The transport `from` uses to reach the other nodes.
    pub fn transport(&self, from: NodeId) -> MemTransport {
        MemTransport { from, network: self.clone() }
    }

    pub fn register(&self, handle: RaftHandle) {
        self.write().nodes.insert(handle.id(), handle);
    }

    pub fn unregister(&self, id: NodeId) -> Option<RaftHandle> {
        self.write().nodes.remove(&id)
    }

    /// Cut `id` off from every other node.
    pub fn isolate(&self, id: NodeId) {
        self.write().isolated.insert(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        self.write().isolated.remove(&id);
    }

    /// Split the network in two: `side` can only reach itself.
    pub fn partition(&self, side: &[NodeId]) {
        let mut state = self.write();
        state.groups.clear();
        state.groups.extend(side.iter().map(|id| (*id, 1)));
    }

    /// Remove every partition and isolation.
    pub fn heal(&self) {
        let mut state = self.write();
        state.groups.clear();
        state.isolated.clear();
    }

    pub fn connected(&self, a: NodeId, b: NodeId) -> bool {
        self.read().connected(a, b)
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<RaftHandle, RkvError> {
        let state = self.read();
        if !state.connected(from, to) {
            return Err(RkvError::Unreachable(format!("node {to} unreachable from {from}")));
        }
        state
            .nodes
            .get(&to)
            .cloned()
            .ok_or_else(|| RkvError::Unreachable(format!("node {to} is not running")))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, NetState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, NetState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct MemTransport {
    from: NodeId,
    network: MemNetwork,
}

impl Transport for MemTransport {
    async fn call(&self, target: NodeId, _addr: &str, request: RaftRequest) -> Result<RaftResponse, RkvError> {
        let handle = self.network.route(self.from, target)?;
        trace!(from = self.from, to = target, kind = request.kind(), "mem rpc");
        let response = handle.handle_rpc(request).await?;
        // A link cut while the request was in flight loses the response.
        if !self.network.connected(self.from, target) {
            return Err(RkvError::Unreachable(format!("node {target} unreachable from {}", self.from)));
        }
        Ok(response)
    }
}
