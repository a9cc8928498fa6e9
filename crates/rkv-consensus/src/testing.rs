//! An in-process cluster over [`MemNetwork`] with fast timers.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rkv_storage::{LogStorage, MemLogStorage};
use rkv_types::{ClusterConfig, KeyRange, NodeId, RkvError};

use crate::config::RaftConfig;
use crate::handle::{start, RaftHandle, Role};
use crate::transport::MemNetwork;

/// Timers scaled down so tests converge in well under a second.
pub fn fast_config(node_id: NodeId) -> RaftConfig {
    RaftConfig {
        heartbeat_interval: Duration::from_millis(20),
        election_timeout_min: Duration::from_millis(100),
        election_timeout_max: Duration::from_millis(200),
        rpc_timeout: Duration::from_millis(60),
        lease_timeout: Duration::from_millis(150),
        commit_timeout: Duration::from_secs(3),
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(80),
        ..RaftConfig::new(node_id)
    }
}

struct TestNode {
    storage: MemLogStorage,
    handle: Option<RaftHandle>,
}

pub struct TestCluster {
    pub network: MemNetwork,
    config: ClusterConfig,
    tweak: fn(&mut RaftConfig),
    nodes: BTreeMap<NodeId, TestNode>,
}

impl TestCluster {
    /// Start nodes `1..=n` as one cluster.
    pub async fn start(n: u64) -> Result<Self, RkvError> {
        Self::start_with(n, |_| {}).await
    }

    /// Like [`start`](Self::start), with `tweak` applied to every node's config.
    pub async fn start_with(n: u64, tweak: fn(&mut RaftConfig)) -> Result<Self, RkvError> {
        let config = ClusterConfig::new((1..=n).map(|id| (id, format!("mem://{id}"))));
        let mut cluster =
            TestCluster { network: MemNetwork::new(), config, tweak, nodes: BTreeMap::new() };
        for id in 1..=n {
            cluster.nodes.insert(id, TestNode { storage: MemLogStorage::new(), handle: None });
            cluster.boot(id, cluster.config.clone()).await?;
        }
        Ok(cluster)
    }

    async fn boot(&mut self, id: NodeId, initial: ClusterConfig) -> Result<RaftHandle, RkvError> {
        let mut cfg = fast_config(id);
        (self.tweak)(&mut cfg);
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| RkvError::InvalidArgument(format!("unknown node {id}")))?;
        let handle = start(cfg, initial, node.storage.clone(), self.network.transport(id)).await?;
        self.network.register(handle.clone());
        node.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Start a fresh node that waits to be added to the cluster.
    pub async fn add_node(&mut self, id: NodeId) -> Result<RaftHandle, RkvError> {
        self.nodes.insert(id, TestNode { storage: MemLogStorage::new(), handle: None });
        self.boot(id, ClusterConfig::default()).await
    }

    pub fn addr(id: NodeId) -> String {
        format!("mem://{id}")
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, id: NodeId) -> Result<RaftHandle, RkvError> {
        self.nodes
            .get(&id)
            .and_then(|n| n.handle.clone())
            .ok_or_else(|| RkvError::InvalidArgument(format!("node {id} is not running")))
    }

    pub fn storage(&self, id: NodeId) -> Option<MemLogStorage> {
        self.nodes.get(&id).map(|n| n.storage.clone())
    }

    /// Stop a node, keeping its storage for [`restart`](Self::restart).
    pub fn stop(&mut self, id: NodeId) {
        if let Some(handle) = self.nodes.get_mut(&id).and_then(|n| n.handle.take()) {
            handle.shutdown();
            self.network.unregister(id);
        }
    }

    pub async fn restart(&mut self, id: NodeId) -> Result<RaftHandle, RkvError> {
        self.stop(id);
        self.boot(id, self.config.clone()).await
    }

    /// Wait for a leader among `among` that no member of `among` has seen
    /// superseded by a higher term.
    pub async fn wait_for_leader(&self, among: &[NodeId], timeout: Duration) -> Result<NodeId, RkvError> {
        let deadline = Instant::now() + timeout;
        loop {
            let statuses: Vec<_> = among
                .iter()
                .filter_map(|id| self.node(*id).ok())
                .map(|h| h.status())
                .collect();
            let max_term = statuses.iter().map(|s| s.term).max().unwrap_or(0);
            let leaders: Vec<_> =
                statuses.iter().filter(|s| s.role == Role::Leader && s.term == max_term).collect();
            if let [leader] = leaders.as_slice() {
                return Ok(leader.id);
            }
            if Instant::now() >= deadline {
                return Err(RkvError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every running node in `ids` has applied `index`.
    pub async fn wait_applied(&self, ids: &[NodeId], index: u64, timeout: Duration) -> Result<(), RkvError> {
        for id in ids {
            self.node(*id)?.wait_applied(index, timeout).await?;
        }
        Ok(())
    }

    /// Live pairs of a node's state machine at its applied index.
    pub async fn contents(&self, id: NodeId) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RkvError> {
        let handle = self.node(id)?;
        let sm = handle.store().read().await;
        Ok(sm.scan(&KeyRange::all(), sm.applied_index(), usize::MAX))
    }

    /// Terms of a node's persisted log entries from `from` onwards.
    pub async fn log_terms(&self, id: NodeId, from: u64) -> Result<Vec<(u64, u64)>, RkvError> {
        let storage = self
            .storage(id)
            .ok_or_else(|| RkvError::InvalidArgument(format!("unknown node {id}")))?;
        let state = storage.log_state().await?;
        let entries = storage.read_range(from.max(state.snapshot_index + 1), state.last_index).await?;
        Ok(entries.into_iter().map(|e| (e.index, e.term)).collect())
    }

    pub fn shutdown(&mut self) {
        for id in self.ids() {
            self.stop(id);
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
