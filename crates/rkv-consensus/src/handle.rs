use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};

use rkv_storage::{LogStorage, MvccStore, SnapshotPin, SnapshotPins};
use rkv_types::{ClusterConfig, CommitRequest, CommitResult, ConfigChange, Mutation, NodeId, RkvError};

use crate::config::RaftConfig;
use crate::engine::{Command, Engine, Event, Reply};
use crate::message::{RaftRequest, RaftResponse};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        })
    }
}

/// A node's consensus state as of its last processed event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub snapshot_index: u64,
    /// Current membership with `leader_hint` set to `leader`.
    pub config: ClusterConfig,
}

/// Everything a transaction reading uncommitted state needs.
///
/// Reads see the state machine at `applied_index` overlaid with `pending`,
/// the writes of entries `applied_index + 1 ..= base_index` in log order.
#[derive(Debug)]
pub struct UncommittedView {
    pub base_index: u64,
    pub base_term: u64,
    pub applied_index: u64,
    pub pending: Vec<Mutation>,
    pub pin: SnapshotPin,
}

/// Start a consensus node and return the handle used to drive it.
pub async fn start<L: LogStorage, T: Transport>(
    cfg: RaftConfig,
    initial: ClusterConfig,
    storage: L,
    transport: T,
) -> Result<RaftHandle, RkvError> {
    let (events, rx) = mpsc::unbounded_channel();
    let commit_timeout = cfg.commit_timeout;
    let engine = Engine::recover(cfg, initial, storage, transport, events.clone()).await?;
    let handle = RaftHandle {
        inner: Arc::new(HandleInner {
            events,
            status: engine.subscribe(),
            store: engine.store.clone(),
            pins: engine.pins.clone(),
            commit_timeout,
        }),
    };
    tokio::spawn(engine.run(rx));
    Ok(handle)
}

struct HandleInner {
    events: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<NodeStatus>,
    store: Arc<RwLock<MvccStore>>,
    pins: SnapshotPins,
    commit_timeout: Duration,
}

/// Cheap, cloneable access to a running consensus node.
#[derive(Clone)]
pub struct RaftHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for RaftHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftHandle").field("id", &self.id()).finish_non_exhaustive()
    }
}

impl RaftHandle {
    pub fn id(&self) -> NodeId {
        self.inner.status.borrow().id
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.status.borrow().role == Role::Leader
    }

    /// The replicated state machine. Writers other than the node itself
    /// must not exist; readers pin their base index through
    /// [`pins`](Self::pins) while holding the read lock.
    pub fn store(&self) -> &Arc<RwLock<MvccStore>> {
        &self.inner.store
    }

    pub fn pins(&self) -> &SnapshotPins {
        &self.inner.pins
    }

    pub fn commit_timeout(&self) -> Duration {
        self.inner.commit_timeout
    }

    async fn request<R>(&self, command: impl FnOnce(Reply<R>) -> Command) -> Result<R, RkvError> {
        let (tx, rx) = oneshot::channel();
        self.inner.events.send(Event::Client(command(tx))).map_err(|_| RkvError::Shutdown)?;
        match tokio::time::timeout(self.inner.commit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RkvError::Shutdown),
            Err(_) => Err(RkvError::Timeout),
        }
    }

    /// Validate `request` against the log and append its writes. Resolves
    /// once the entry is committed and applied; followers forward to the
    /// leader.
    pub async fn commit(&self, request: CommitRequest) -> Result<CommitResult, RkvError> {
        self.request(|reply| Command::Commit { request, forwarded: false, reply }).await
    }

    /// An index that includes every write committed before this call.
    pub async fn read_index(&self) -> Result<u64, RkvError> {
        self.request(|reply| Command::ReadIndex { forwarded: false, reply }).await
    }

    /// Wait until the local state machine has applied `index`.
    pub async fn wait_applied(&self, index: u64, timeout: Duration) -> Result<(), RkvError> {
        self.wait_for(timeout, move |s| s.last_applied >= index).await.map(|_| ())
    }

    /// Wait until `pred` holds for the node status.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(&NodeStatus) -> bool + Send,
    ) -> Result<NodeStatus, RkvError> {
        let mut rx = self.inner.status.clone();
        let wait = async move {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if pred(&status) {
                        return Ok(status.clone());
                    }
                }
                rx.changed().await.map_err(|_| RkvError::Shutdown)?;
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(Err(RkvError::Timeout))
    }

    pub async fn uncommitted_view(&self) -> Result<UncommittedView, RkvError> {
        self.request(|reply| Command::UncommittedView { reply }).await
    }

    pub async fn change_membership(&self, change: ConfigChange) -> Result<CommitResult, RkvError> {
        self.request(|reply| Command::ChangeMembership { change, reply }).await
    }

    pub async fn step_down(&self) -> Result<(), RkvError> {
        self.request(|reply| Command::StepDown { reply }).await
    }

    /// Start an election now instead of waiting for the timeout.
    pub async fn campaign(&self) -> Result<(), RkvError> {
        self.request(|reply| Command::Campaign { reply }).await
    }

    /// Serve a request from another node.
    pub async fn handle_rpc(&self, request: RaftRequest) -> Result<RaftResponse, RkvError> {
        match request {
            RaftRequest::ForwardCommit(request) => self
                .request(|reply| Command::Commit { request, forwarded: true, reply })
                .await
                .map(RaftResponse::Commit),
            RaftRequest::ForwardReadIndex => self
                .request(|reply| Command::ReadIndex { forwarded: true, reply })
                .await
                .map(RaftResponse::ReadIndex),
            request => {
                let (tx, rx) = oneshot::channel();
                self.inner
                    .events
                    .send(Event::Rpc { request, reply: tx })
                    .map_err(|_| RkvError::Shutdown)?;
                rx.await.map_err(|_| RkvError::Shutdown)?
            }
        }
    }

    /// Stop the node. Pending requests fail with [`RkvError::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.inner.events.send(Event::Shutdown);
    }
}
