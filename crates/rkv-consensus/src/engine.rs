use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rkv_storage::{
    HardState, LogEntry, LogPayload, LogStorage, MvccStore, Snapshot, SnapshotMeta, SnapshotPins,
};
use rkv_types::{
    ClusterConfig, CommitRequest, CommitResult, ConfigChange, NodeId, RkvError,
};

use crate::config::RaftConfig;
use crate::handle::{NodeStatus, Role, UncommittedView};
use crate::message::{
    AppendRequest, AppendResponse, RaftRequest, RaftResponse, SnapshotChunk, SnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::peer::{PeerJob, PeerWorker};
use crate::transport::Transport;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, RkvError>>;

// ---------------------------------------------------------------------------
// Engine inputs
// ---------------------------------------------------------------------------

pub(crate) enum Event {
    /// A consensus RPC from another node.
    Rpc { request: RaftRequest, reply: Reply<RaftResponse> },
    /// The outcome of a request this node sent to `peer`.
    Peer { peer: NodeId, sent: Sent, result: Result<RaftResponse, RkvError> },
    Client(Command),
    Shutdown,
}

/// What a peer response answers.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Sent {
    Vote { term: u64 },
    Append { term: u64, prev_index: u64, round: u64 },
    Snapshot { term: u64, last_included_index: u64 },
}

pub(crate) enum Command {
    /// `forwarded` requests came from a follower and are never forwarded again.
    Commit { request: CommitRequest, forwarded: bool, reply: Reply<CommitResult> },
    ReadIndex { forwarded: bool, reply: Reply<u64> },
    UncommittedView { reply: Reply<UncommittedView> },
    ChangeMembership { change: ConfigChange, reply: Reply<CommitResult> },
    StepDown { reply: Reply<()> },
    Campaign { reply: Reply<()> },
}

// ---------------------------------------------------------------------------
// Leader bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Progress {
    next_index: u64,
    match_index: u64,
    /// An append or snapshot is outstanding; at most one per peer.
    inflight: bool,
    last_ack: Option<Instant>,
    /// Highest heartbeat round the peer answered in the current term.
    acked_round: u64,
}

impl Progress {
    fn new(next_index: u64) -> Self {
        Progress { next_index, match_index: 0, inflight: false, last_ack: None, acked_round: 0 }
    }
}

struct Proposal {
    term: u64,
    reply: Reply<CommitResult>,
}

enum ReadWaiter {
    Index(Reply<u64>),
    /// A read-only commit whose reads were validated against the log.
    Validate { term: u64, reply: Reply<CommitResult> },
}

impl ReadWaiter {
    fn complete(self, index: u64) {
        match self {
            ReadWaiter::Index(reply) => {
                let _ = reply.send(Ok(index));
            }
            ReadWaiter::Validate { term, reply } => {
                let _ = reply.send(Ok(CommitResult { index, term }));
            }
        }
    }

    fn fail(self, err: RkvError) {
        match self {
            ReadWaiter::Index(reply) => {
                let _ = reply.send(Err(err));
            }
            ReadWaiter::Validate { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

struct PendingRead {
    round: u64,
    index: u64,
    waiter: ReadWaiter,
}

struct IncomingSnapshot {
    id: String,
    index: u64,
    term: u64,
    config: ClusterConfig,
    data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The single owner of a node's consensus state.
///
/// Runs as one task that serializes RPCs, peer responses, client commands
/// and timer ticks. Storage writes complete before the event that caused
/// them is answered.
pub(crate) struct Engine<L, T> {
    id: NodeId,
    cfg: RaftConfig,
    storage: Arc<L>,
    transport: Arc<T>,
    events: mpsc::UnboundedSender<Event>,
    pub(crate) store: Arc<RwLock<MvccStore>>,
    pub(crate) pins: SnapshotPins,
    status: watch::Sender<NodeStatus>,

    role: Role,
    term: u64,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    leaderless_since: Option<Instant>,
    election_deadline: Instant,
    votes: BTreeSet<NodeId>,

    /// Entries `snapshot_index + 1 ..= last_index()`.
    log: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
    snapshot_config: ClusterConfig,
    snapshot: Option<Arc<Snapshot>>,
    incoming: Option<IncomingSnapshot>,
    config: ClusterConfig,
    config_index: u64,
    commit_index: u64,
    last_applied: u64,

    peers: BTreeMap<NodeId, PeerWorker>,
    progress: BTreeMap<NodeId, Progress>,
    /// Removed peers still owed the entry that removes them, with the time
    /// the leader gives up on them.
    departing: BTreeMap<NodeId, Instant>,
    round: u64,
    last_broadcast: Instant,
    leader_since: Instant,
    term_start_index: u64,
    proposals: BTreeMap<u64, Proposal>,
    pending_reads: Vec<PendingRead>,
}

impl<L: LogStorage, T: Transport> Engine<L, T> {
    /// Rebuild a node from its durable state. `initial` is the membership
    /// used when neither the snapshot nor the log carries one.
    pub(crate) async fn recover(
        cfg: RaftConfig,
        initial: ClusterConfig,
        storage: L,
        transport: T,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self, RkvError> {
        cfg.validate()?;
        let hard = storage.read_hard_state().await?;
        let snapshot = storage.load_snapshot().await?;
        let state = storage.log_state().await?;
        let log = storage.read_range(state.snapshot_index + 1, state.last_index).await?;

        let (store, snapshot_config) = match &snapshot {
            Some(s) => (
                MvccStore::restore(&s.data, s.meta.last_included_index, s.meta.last_included_term)?,
                s.meta.config.clone(),
            ),
            None => (MvccStore::new(), initial),
        };
        let now = Instant::now();
        let (status, _) = watch::channel(NodeStatus { id: cfg.node_id, ..NodeStatus::default() });

        let mut engine = Engine {
            id: cfg.node_id,
            storage: Arc::new(storage),
            transport: Arc::new(transport),
            events,
            store: Arc::new(RwLock::new(store)),
            pins: SnapshotPins::new(),
            status,
            role: Role::Follower,
            term: hard.current_term,
            voted_for: hard.voted_for,
            leader: None,
            leaderless_since: Some(now),
            election_deadline: now + cfg.random_election_timeout(),
            votes: BTreeSet::new(),
            log,
            snapshot_index: state.snapshot_index,
            snapshot_term: state.snapshot_term,
            snapshot_config: snapshot_config.clone(),
            snapshot: snapshot.map(Arc::new),
            incoming: None,
            config: snapshot_config,
            config_index: state.snapshot_index,
            commit_index: state.snapshot_index,
            last_applied: state.snapshot_index,
            peers: BTreeMap::new(),
            progress: BTreeMap::new(),
            departing: BTreeMap::new(),
            round: 0,
            last_broadcast: now,
            leader_since: now,
            term_start_index: 0,
            proposals: BTreeMap::new(),
            pending_reads: Vec::new(),
            cfg,
        };
        engine.recompute_config();
        engine.sync_peers();
        info!(
            node_id = engine.id,
            term = engine.term,
            snapshot_index = engine.snapshot_index,
            last_index = engine.last_index(),
            members = engine.config.members.len(),
            "raft node recovered"
        );
        engine.publish();
        Ok(engine)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.subscribe()
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut ticker = tokio::time::interval(self.cfg.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let result = tokio::select! {
                _ = ticker.tick() => self.tick().await,
                event = events.recv() => match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => self.handle_event(event).await,
                },
            };
            if let Err(e) = result {
                error!(node_id = self.id, error = %e, "raft engine error");
            }
            self.publish();
        }
        info!(node_id = self.id, term = self.term, "raft node stopped");
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), RkvError> {
        match event {
            Event::Rpc { request, reply } => {
                let kind = request.kind();
                let result = match request {
                    RaftRequest::Vote(req) => self.handle_vote(req).await.map(RaftResponse::Vote),
                    RaftRequest::AppendEntries(req) => {
                        self.handle_append(req).await.map(RaftResponse::AppendEntries)
                    }
                    RaftRequest::InstallSnapshot(chunk) => {
                        self.handle_snapshot_chunk(chunk).await.map(RaftResponse::InstallSnapshot)
                    }
                    RaftRequest::ForwardCommit(_) | RaftRequest::ForwardReadIndex => Err(
                        RkvError::InvalidArgument(format!("{kind} is not a peer message")),
                    ),
                };
                if let Err(e) = &result {
                    warn!(node_id = self.id, kind, error = %e, "rpc failed");
                }
                let _ = reply.send(result);
                Ok(())
            }
            Event::Peer { peer, sent, result } => self.handle_peer_result(peer, sent, result).await,
            Event::Client(command) => self.handle_command(command).await,
            Event::Shutdown => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Log access
    // -----------------------------------------------------------------------

    fn last_index(&self) -> u64 {
        self.snapshot_index + self.log.len() as u64
    }

    fn last_term(&self) -> u64 {
        self.log.last().map_or(self.snapshot_term, |e| e.term)
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.log.get((index - self.snapshot_index - 1) as usize)
    }

    /// Term of the entry at `index`, or `None` if compacted away or absent.
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Append at the local tail and persist.
    async fn append_local(&mut self, entries: Vec<LogEntry>) -> Result<(), RkvError> {
        if entries.is_empty() {
            return Ok(());
        }
        let (prev_index, prev_term) = (self.last_index(), self.last_term());
        self.storage.append(prev_index, prev_term, entries.clone()).await?;
        let mut config_changed = false;
        for entry in entries {
            if let LogPayload::Config(config) = &entry.payload {
                self.config = config.clone();
                self.config_index = entry.index;
                config_changed = true;
            }
            self.log.push(entry);
        }
        if config_changed {
            let members: Vec<NodeId> = self.config.members.keys().copied().collect();
            info!(node_id = self.id, index = self.config_index, ?members, "membership changed");
            self.sync_peers();
        }
        Ok(())
    }

    /// Drop entries `>= index`. Their proposals will never commit here.
    async fn truncate_from(&mut self, index: u64) -> Result<(), RkvError> {
        if index <= self.commit_index {
            return Err(RkvError::Consensus(format!(
                "refusing to truncate committed entry {index} (commit {})",
                self.commit_index
            )));
        }
        self.storage.truncate_suffix(index).await?;
        self.log.truncate((index - self.snapshot_index - 1) as usize);
        warn!(node_id = self.id, from = index, "truncated conflicting log suffix");
        let lost = self.proposals.split_off(&index);
        for (_, proposal) in lost {
            let _ = proposal.reply.send(Err(self.not_leader_error()));
        }
        if self.config_index >= index {
            self.recompute_config();
            self.sync_peers();
        }
        Ok(())
    }

    /// Reload the in-memory log from storage after a failed append.
    async fn reload_log(&mut self) -> Result<(), RkvError> {
        let state = self.storage.log_state().await?;
        self.log = self.storage.read_range(state.snapshot_index + 1, state.last_index).await?;
        self.recompute_config();
        self.sync_peers();
        Ok(())
    }

    fn recompute_config(&mut self) {
        let latest = self.log.iter().rev().find_map(|e| match &e.payload {
            LogPayload::Config(c) => Some((e.index, c.clone())),
            _ => None,
        });
        let (index, config) = latest.unwrap_or((self.snapshot_index, self.snapshot_config.clone()));
        self.config_index = index;
        self.config = config;
    }

    /// Membership in effect at `index` (which must not be compacted).
    fn config_at(&self, index: u64) -> ClusterConfig {
        self.log
            .iter()
            .rev()
            .filter(|e| e.index <= index)
            .find_map(|e| match &e.payload {
                LogPayload::Config(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap_or_else(|| self.snapshot_config.clone())
    }

    /// One worker per other member; leaders also track their progress.
    ///
    /// A leader keeps replicating to a removed peer until it holds the config
    /// entry that removes it. Otherwise the peer never learns it is out and
    /// campaigns against the remaining members.
    fn sync_peers(&mut self) {
        let wanted: BTreeMap<NodeId, String> = self
            .config
            .members
            .iter()
            .filter(|(id, _)| **id != self.id)
            .map(|(id, addr)| (*id, addr.clone()))
            .collect();
        let now = Instant::now();
        if self.role == Role::Leader {
            for (id, progress) in &self.progress {
                if !wanted.contains_key(id) && progress.match_index < self.config_index {
                    self.departing.entry(*id).or_insert(now + self.cfg.commit_timeout);
                }
            }
        } else {
            self.departing.clear();
        }
        let config_index = self.config_index;
        let progress = &self.progress;
        self.departing.retain(|id, give_up| {
            !wanted.contains_key(id)
                && *give_up > now
                && progress.get(id).is_some_and(|p| p.match_index < config_index)
        });
        let departing = &self.departing;
        self.peers
            .retain(|id, worker| wanted.get(id) == Some(&worker.addr) || departing.contains_key(id));
        for (id, addr) in &wanted {
            if !self.peers.contains_key(id) {
                let worker = PeerWorker::spawn(
                    *id,
                    addr.clone(),
                    self.transport.clone(),
                    self.events.clone(),
                    &self.cfg,
                );
                self.peers.insert(*id, worker);
            }
        }
        if self.role == Role::Leader {
            let next = self.last_index() + 1;
            let departing = &self.departing;
            self.progress.retain(|id, _| wanted.contains_key(id) || departing.contains_key(id));
            for id in wanted.keys() {
                self.progress.entry(*id).or_insert_with(|| Progress::new(next));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Roles
    // -----------------------------------------------------------------------

    async fn persist_hard_state(&self) -> Result<(), RkvError> {
        self.storage
            .save_hard_state(HardState { current_term: self.term, voted_for: self.voted_for })
            .await
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + self.cfg.random_election_timeout();
    }

    fn set_leader(&mut self, leader: Option<NodeId>) {
        if leader.is_some() {
            self.leaderless_since = None;
        } else if self.leaderless_since.is_none() {
            self.leaderless_since = Some(Instant::now());
        }
        self.leader = leader;
    }

    async fn become_follower(&mut self, term: u64, leader: Option<NodeId>) -> Result<(), RkvError> {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist_hard_state().await?;
        }
        if self.role != Role::Follower {
            info!(node_id = self.id, term = self.term, from = %self.role, "became follower");
        }
        let was_leader = self.role == Role::Leader;
        if was_leader {
            self.progress.clear();
            let err = RkvError::NotLeader {
                leader,
                addr: leader.and_then(|id| self.config.addr(id)).map(str::to_string),
            };
            for read in self.pending_reads.drain(..) {
                read.waiter.fail(err.clone());
            }
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.set_leader(leader);
        self.reset_election_deadline();
        if was_leader && !self.departing.is_empty() {
            self.sync_peers();
        }
        Ok(())
    }

    async fn start_election(&mut self) -> Result<(), RkvError> {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id);
        self.set_leader(None);
        self.persist_hard_state().await?;
        self.votes = BTreeSet::from([self.id]);
        self.reset_election_deadline();
        info!(node_id = self.id, term = self.term, "starting election");

        if self.has_quorum(&self.votes) {
            return self.become_leader().await;
        }
        let request = VoteRequest {
            term: self.term,
            candidate_id: self.id,
            last_log_index: self.last_index(),
            last_log_term: self.last_term(),
        };
        for worker in self.peers.values() {
            worker.send(PeerJob::Rpc {
                request: RaftRequest::Vote(request.clone()),
                sent: Sent::Vote { term: self.term },
            });
        }
        Ok(())
    }

    async fn become_leader(&mut self) -> Result<(), RkvError> {
        info!(node_id = self.id, term = self.term, last_index = self.last_index(), "became leader");
        self.role = Role::Leader;
        self.set_leader(Some(self.id));
        self.votes.clear();
        self.progress.clear();
        self.departing.clear();
        self.pending_reads.clear();
        let now = Instant::now();
        self.leader_since = now;
        self.sync_peers();

        // Entries from earlier terms only commit once one from this term does.
        let blank = LogEntry::new(self.last_index() + 1, self.term, LogPayload::Blank);
        self.term_start_index = blank.index;
        self.append_local(vec![blank]).await?;
        self.heartbeat(now);
        self.advance_commit().await
    }

    fn has_quorum(&self, acks: &BTreeSet<NodeId>) -> bool {
        let count = self.config.members.keys().filter(|id| acks.contains(id)).count();
        count >= self.config.quorum()
    }

    fn not_leader_error(&self) -> RkvError {
        if self.leader.is_none() {
            if let Some(since) = self.leaderless_since {
                if since.elapsed() > self.cfg.election_timeout_max {
                    return RkvError::Unreachable("no leader elected".to_string());
                }
            }
        }
        RkvError::NotLeader {
            leader: self.leader,
            addr: self.leader.and_then(|id| self.config.addr(id)).map(str::to_string),
        }
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    async fn tick(&mut self) -> Result<(), RkvError> {
        let now = Instant::now();
        match self.role {
            Role::Leader => {
                if self.departing.values().any(|give_up| *give_up <= now) {
                    self.sync_peers();
                }
                if now.duration_since(self.last_broadcast) >= self.cfg.heartbeat_interval {
                    self.heartbeat(now);
                }
                if !self.lease_valid(now) {
                    warn!(node_id = self.id, term = self.term, "lost contact with a majority, stepping down");
                    for read in self.pending_reads.drain(..) {
                        read.waiter.fail(RkvError::Unreachable("leader lost its majority".into()));
                    }
                    self.become_follower(self.term, None).await?;
                }
            }
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline && self.config.contains(self.id) {
                    self.start_election().await?;
                }
            }
        }
        Ok(())
    }

    /// A majority of members answered within the lease.
    fn lease_valid(&self, now: Instant) -> bool {
        if now.duration_since(self.leader_since) < self.cfg.lease_timeout {
            return true;
        }
        let fresh = self
            .config
            .members
            .keys()
            .filter(|id| {
                **id == self.id
                    || self
                        .progress
                        .get(id)
                        .and_then(|p| p.last_ack)
                        .is_some_and(|t| now.duration_since(t) < self.cfg.lease_timeout)
            })
            .count();
        fresh >= self.config.quorum()
    }

    // -----------------------------------------------------------------------
    // Replication (leader)
    // -----------------------------------------------------------------------

    /// Start a new heartbeat round to every peer.
    fn heartbeat(&mut self, now: Instant) {
        self.round += 1;
        self.last_broadcast = now;
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.replicate_to(peer, true);
        }
    }

    fn broadcast_entries(&mut self) {
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.replicate_to(peer, false);
        }
    }

    /// Send `peer` its next batch, a snapshot if it is behind the log, or a
    /// heartbeat when `heartbeat` is set and there is nothing to send.
    fn replicate_to(&mut self, peer: NodeId, heartbeat: bool) {
        let Some(worker) = self.peers.get(&peer) else { return };
        let Some(progress) = self.progress.get_mut(&peer) else { return };
        if progress.inflight {
            return;
        }
        if progress.next_index <= self.snapshot_index {
            match &self.snapshot {
                Some(snapshot) => {
                    debug!(node_id = self.id, peer, index = snapshot.meta.last_included_index, "sending snapshot");
                    progress.inflight = true;
                    worker.send(PeerJob::Snapshot {
                        term: self.term,
                        leader_id: self.id,
                        snapshot: snapshot.clone(),
                    });
                }
                None => error!(node_id = self.id, peer, "log compacted but no snapshot to send"),
            }
            return;
        }
        let last = self.snapshot_index + self.log.len() as u64;
        if progress.next_index > last && !heartbeat {
            return;
        }
        let prev_index = progress.next_index - 1;
        let prev_term = if prev_index == self.snapshot_index {
            self.snapshot_term
        } else {
            self.log[(prev_index - self.snapshot_index - 1) as usize].term
        };
        let from = (progress.next_index - self.snapshot_index - 1) as usize;
        let to = (from + self.cfg.max_append_entries).min(self.log.len());
        let entries = self.log[from..to].to_vec();
        progress.inflight = true;
        worker.send(PeerJob::Rpc {
            request: RaftRequest::AppendEntries(AppendRequest {
                term: self.term,
                leader_id: self.id,
                prev_log_index: prev_index,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.commit_index,
            }),
            sent: Sent::Append { term: self.term, prev_index, round: self.round },
        });
    }

    async fn handle_peer_result(
        &mut self,
        peer: NodeId,
        sent: Sent,
        result: Result<RaftResponse, RkvError>,
    ) -> Result<(), RkvError> {
        if matches!(sent, Sent::Append { .. } | Sent::Snapshot { .. }) {
            if let Some(progress) = self.progress.get_mut(&peer) {
                progress.inflight = false;
            }
        }
        let response = match result {
            Ok(response) => response,
            Err(_) => return Ok(()),
        };
        match (sent, response) {
            (Sent::Vote { term }, RaftResponse::Vote(resp)) => self.on_vote(peer, term, resp).await,
            (Sent::Append { term, prev_index, round }, RaftResponse::AppendEntries(resp)) => {
                self.on_append(peer, term, prev_index, round, resp).await
            }
            (Sent::Snapshot { term, last_included_index }, RaftResponse::InstallSnapshot(resp)) => {
                self.on_snapshot(peer, term, last_included_index, resp).await
            }
            (sent, response) => {
                warn!(node_id = self.id, peer, ?sent, kind = response.kind(), "mismatched peer response");
                Ok(())
            }
        }
    }

    async fn on_vote(&mut self, peer: NodeId, term: u64, resp: VoteResponse) -> Result<(), RkvError> {
        if resp.term > self.term {
            return self.become_follower(resp.term, None).await;
        }
        if self.role != Role::Candidate || term != self.term || !resp.vote_granted {
            return Ok(());
        }
        self.votes.insert(peer);
        if self.has_quorum(&self.votes) {
            self.become_leader().await?;
        }
        Ok(())
    }

    async fn on_append(
        &mut self,
        peer: NodeId,
        term: u64,
        prev_index: u64,
        round: u64,
        resp: AppendResponse,
    ) -> Result<(), RkvError> {
        if resp.term > self.term {
            return self.become_follower(resp.term, None).await;
        }
        if self.role != Role::Leader || term != self.term {
            return Ok(());
        }
        let Some(progress) = self.progress.get_mut(&peer) else { return Ok(()) };
        progress.last_ack = Some(Instant::now());
        progress.acked_round = progress.acked_round.max(round);
        if resp.success {
            progress.match_index = progress.match_index.max(resp.match_index);
            progress.next_index = progress.match_index + 1;
            if self.departing.contains_key(&peer) && progress.match_index >= self.config_index {
                info!(node_id = self.id, peer, "departing peer has its removal");
                self.sync_peers();
                return Ok(());
            }
            self.advance_commit().await?;
        } else {
            // Search for the last matching index between the known match and
            // the rejected position. A short follower log is probed at its end.
            let lo = progress.match_index;
            let probe = if resp.conflict_index > 0 && resp.conflict_index < prev_index {
                resp.conflict_index - 1
            } else {
                lo + prev_index.saturating_sub(lo) / 2
            };
            progress.next_index = probe.max(lo) + 1;
            debug!(node_id = self.id, peer, prev_index, next_index = progress.next_index, "append rejected");
        }
        self.check_reads();
        let behind_round = self.pending_reads.iter().any(|r| r.round > round);
        self.replicate_to(peer, behind_round);
        Ok(())
    }

    async fn on_snapshot(
        &mut self,
        peer: NodeId,
        term: u64,
        last_included_index: u64,
        resp: SnapshotResponse,
    ) -> Result<(), RkvError> {
        if resp.term > self.term {
            return self.become_follower(resp.term, None).await;
        }
        if self.role != Role::Leader || term != self.term {
            return Ok(());
        }
        let Some(progress) = self.progress.get_mut(&peer) else { return Ok(()) };
        progress.last_ack = Some(Instant::now());
        if resp.success {
            progress.match_index = progress.match_index.max(last_included_index);
            progress.next_index = progress.match_index + 1;
            info!(node_id = self.id, peer, index = last_included_index, "peer installed snapshot");
            self.advance_commit().await?;
        }
        self.replicate_to(peer, false);
        Ok(())
    }

    /// Highest index stored on a majority of members.
    fn quorum_match(&self) -> u64 {
        let mut matched: Vec<u64> = self
            .config
            .members
            .keys()
            .map(|id| {
                if *id == self.id {
                    self.last_index()
                } else {
                    self.progress.get(id).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched.get(self.config.quorum() - 1).copied().unwrap_or(0)
    }

    /// Highest heartbeat round answered by a majority of members.
    fn confirmed_round(&self) -> u64 {
        let mut rounds: Vec<u64> = self
            .config
            .members
            .keys()
            .map(|id| {
                if *id == self.id {
                    self.round
                } else {
                    self.progress.get(id).map_or(0, |p| p.acked_round)
                }
            })
            .collect();
        rounds.sort_unstable_by(|a, b| b.cmp(a));
        rounds.get(self.config.quorum() - 1).copied().unwrap_or(0)
    }

    async fn advance_commit(&mut self) -> Result<(), RkvError> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let candidate = self.quorum_match();
        // Only entries of the current term are committed by counting replicas.
        if candidate > self.commit_index && self.term_at(candidate) == Some(self.term) {
            debug!(node_id = self.id, commit = candidate, "commit index advanced");
            self.commit_index = candidate;
            self.apply_committed().await?;
            if !self.config.contains(self.id) && self.config_index <= self.commit_index {
                info!(node_id = self.id, "removed from the cluster, stepping down");
                self.become_follower(self.term, None).await?;
                return Ok(());
            }
        }
        self.check_reads();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Apply and snapshot
    // -----------------------------------------------------------------------

    async fn apply_committed(&mut self) -> Result<(), RkvError> {
        if self.last_applied >= self.commit_index {
            return Ok(());
        }
        let store = self.store.clone();
        let mut sm = store.write().await;
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.entry(index) else {
                return Err(RkvError::Consensus(format!("committed entry {index} missing from log")));
            };
            let term = entry.term;
            match &entry.payload {
                LogPayload::Write(mutations) => sm.apply(index, term, mutations)?,
                LogPayload::Blank | LogPayload::Config(_) => sm.mark_applied(index, term),
            }
            self.last_applied = index;
            if let Some(proposal) = self.proposals.remove(&index) {
                let result = if proposal.term == term {
                    Ok(CommitResult { index, term })
                } else {
                    Err(self.not_leader_error())
                };
                let _ = proposal.reply.send(result);
            }
        }

        let retained = self.last_applied.saturating_sub(self.cfg.history_retention);
        let horizon = self.pins.oldest().map_or(retained, |pin| pin.min(retained));
        if horizon >= sm.horizon() + self.cfg.compaction_step() {
            sm.compact(horizon);
            debug!(node_id = self.id, horizon, "compacted version history");
        }
        drop(sm);

        if self.last_applied - self.snapshot_index >= self.cfg.snapshot_threshold {
            self.take_snapshot().await?;
        }
        Ok(())
    }

    async fn take_snapshot(&mut self) -> Result<(), RkvError> {
        let index = self.last_applied;
        let Some(term) = self.term_at(index) else {
            return Err(RkvError::Consensus(format!("no term for applied index {index}")));
        };
        let config = self.config_at(index);
        let data = self.store.read().await.snapshot_image()?;
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: index,
                last_included_term: term,
                config: config.clone(),
                snapshot_id: Uuid::new_v4().to_string(),
            },
            data,
        };
        self.storage.install_snapshot(snapshot.clone()).await?;
        self.log.drain(..(index - self.snapshot_index) as usize);
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.snapshot_config = config;
        info!(node_id = self.id, index, term, bytes = snapshot.data.len(), "snapshot taken");
        self.snapshot = Some(Arc::new(snapshot));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // RPC handlers
    // -----------------------------------------------------------------------

    async fn handle_vote(&mut self, req: VoteRequest) -> Result<VoteResponse, RkvError> {
        if req.term > self.term {
            self.become_follower(req.term, None).await?;
        }
        let up_to_date = (req.last_log_term, req.last_log_index) >= (self.last_term(), self.last_index());
        let granted = req.term == self.term
            && up_to_date
            && self.voted_for.map_or(true, |v| v == req.candidate_id);
        if granted {
            self.voted_for = Some(req.candidate_id);
            self.persist_hard_state().await?;
            self.reset_election_deadline();
            debug!(node_id = self.id, term = self.term, candidate = req.candidate_id, "vote granted");
        }
        Ok(VoteResponse { term: self.term, vote_granted: granted })
    }

    async fn handle_append(&mut self, req: AppendRequest) -> Result<AppendResponse, RkvError> {
        let reject = |term: u64, conflict_index: u64| AppendResponse {
            term,
            success: false,
            match_index: 0,
            conflict_index,
        };
        if req.term < self.term {
            return Ok(reject(self.term, 0));
        }
        self.become_follower(req.term, Some(req.leader_id)).await?;

        let mut prev_index = req.prev_log_index;
        let mut prev_term = req.prev_log_term;
        let mut entries = req.entries;
        // Entries covered by the local snapshot are committed and match.
        if prev_index < self.snapshot_index {
            let covered = (self.snapshot_index - prev_index) as usize;
            if covered >= entries.len() {
                return Ok(AppendResponse {
                    term: self.term,
                    success: true,
                    match_index: self.snapshot_index,
                    conflict_index: 0,
                });
            }
            entries.drain(..covered);
            prev_index = self.snapshot_index;
            prev_term = self.snapshot_term;
        }
        match self.term_at(prev_index) {
            None => return Ok(reject(self.term, self.last_index() + 1)),
            Some(term) if term != prev_term => return Ok(reject(self.term, prev_index)),
            Some(_) => {}
        }

        let last_new = prev_index + entries.len() as u64;
        let mut fresh_from = None;
        for (i, entry) in entries.iter().enumerate() {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index).await?;
                    fresh_from = Some(i);
                    break;
                }
                None => {
                    fresh_from = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = fresh_from {
            let fresh = entries.split_off(i);
            if let Err(e) = self.append_local(fresh).await {
                warn!(node_id = self.id, error = %e, "append failed, reloading log");
                self.reload_log().await?;
                return Ok(reject(self.term, self.last_index() + 1));
            }
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(last_new).max(self.commit_index);
            self.apply_committed().await?;
        }
        Ok(AppendResponse { term: self.term, success: true, match_index: last_new, conflict_index: 0 })
    }

    async fn handle_snapshot_chunk(&mut self, chunk: SnapshotChunk) -> Result<SnapshotResponse, RkvError> {
        let fail = |term| SnapshotResponse { term, success: false };
        if chunk.term < self.term {
            return Ok(fail(self.term));
        }
        self.become_follower(chunk.term, Some(chunk.leader_id)).await?;

        if chunk.offset == 0 {
            self.incoming = Some(IncomingSnapshot {
                id: chunk.snapshot_id.clone(),
                index: chunk.last_included_index,
                term: chunk.last_included_term,
                config: chunk.config.clone(),
                data: Vec::new(),
            });
        }
        let Some(incoming) = self.incoming.as_mut() else {
            return Ok(fail(self.term));
        };
        if incoming.id != chunk.snapshot_id || incoming.data.len() as u64 != chunk.offset {
            self.incoming = None;
            return Ok(fail(self.term));
        }
        incoming.data.extend_from_slice(&chunk.data);
        if !chunk.done {
            return Ok(SnapshotResponse { term: self.term, success: true });
        }
        let Some(incoming) = self.incoming.take() else {
            return Ok(fail(self.term));
        };
        if incoming.index <= self.commit_index {
            return Ok(SnapshotResponse { term: self.term, success: true });
        }
        self.install_snapshot(incoming).await?;
        Ok(SnapshotResponse { term: self.term, success: true })
    }

    async fn install_snapshot(&mut self, incoming: IncomingSnapshot) -> Result<(), RkvError> {
        let (index, term) = (incoming.index, incoming.term);
        let restored = MvccStore::restore(&incoming.data, index, term)?;
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: index,
                last_included_term: term,
                config: incoming.config.clone(),
                snapshot_id: incoming.id,
            },
            data: incoming.data,
        };
        self.storage.install_snapshot(snapshot.clone()).await?;

        let keep_suffix = self.term_at(index) == Some(term);
        let covered = (index.min(self.last_index()) - self.snapshot_index) as usize;
        if keep_suffix {
            self.log.drain(..covered);
        } else {
            self.log.clear();
        }
        // Whether entries this node proposed made it into the snapshot is unknown.
        let survivors = self.proposals.split_off(&(index + 1));
        for (_, proposal) in std::mem::replace(&mut self.proposals, survivors) {
            let _ = proposal.reply.send(Err(RkvError::Timeout));
        }
        if !keep_suffix {
            for (_, proposal) in std::mem::take(&mut self.proposals) {
                let _ = proposal.reply.send(Err(self.not_leader_error()));
            }
        }

        self.snapshot_index = index;
        self.snapshot_term = term;
        self.snapshot_config = incoming.config;
        self.snapshot = Some(Arc::new(snapshot));
        self.commit_index = self.commit_index.max(index);
        self.last_applied = index;
        *self.store.write().await = restored;
        self.recompute_config();
        self.sync_peers();
        info!(node_id = self.id, index, term, "installed snapshot from leader");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Client commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) -> Result<(), RkvError> {
        match command {
            Command::Commit { request, forwarded, reply } => self.commit(request, forwarded, reply).await,
            Command::ReadIndex { forwarded, reply } => {
                if self.role == Role::Leader {
                    self.read_index(ReadWaiter::Index(reply));
                } else if forwarded {
                    let _ = reply.send(Err(self.not_leader_error()));
                } else {
                    self.forward_read_index(reply);
                }
                Ok(())
            }
            Command::UncommittedView { reply } => {
                let _ = reply.send(Ok(self.uncommitted_view()));
                Ok(())
            }
            Command::ChangeMembership { change, reply } => self.change_membership(change, reply).await,
            Command::StepDown { reply } => {
                if self.role != Role::Leader {
                    let _ = reply.send(Err(self.not_leader_error()));
                    return Ok(());
                }
                info!(node_id = self.id, term = self.term, "stepping down on request");
                self.become_follower(self.term, None).await?;
                // Give the other members a chance to win the next election.
                self.election_deadline = Instant::now() + self.cfg.election_timeout_max * 2;
                let _ = reply.send(Ok(()));
                Ok(())
            }
            Command::Campaign { reply } => {
                if self.role != Role::Leader {
                    if !self.config.contains(self.id) {
                        let _ = reply.send(Err(RkvError::InvalidState("not a cluster member".into())));
                        return Ok(());
                    }
                    self.start_election().await?;
                }
                let _ = reply.send(Ok(()));
                Ok(())
            }
        }
    }

    async fn commit(
        &mut self,
        request: CommitRequest,
        forwarded: bool,
        reply: Reply<CommitResult>,
    ) -> Result<(), RkvError> {
        if self.role != Role::Leader {
            if forwarded {
                let _ = reply.send(Err(self.not_leader_error()));
            } else {
                self.forward_commit(request, reply);
            }
            return Ok(());
        }
        if let Some(reason) = self.find_conflict(&request).await {
            debug!(node_id = self.id, base_index = request.base_index, %reason, "commit rejected");
            let _ = reply.send(Err(RkvError::Conflict(reason)));
            return Ok(());
        }
        if request.writes.is_empty() {
            self.read_index(ReadWaiter::Validate { term: self.term, reply });
            return Ok(());
        }

        let index = self.last_index() + 1;
        let entry = LogEntry::new(index, self.term, LogPayload::Write(request.writes));
        if let Err(e) = self.append_local(vec![entry]).await {
            let _ = reply.send(Err(e));
            return Ok(());
        }
        self.proposals.insert(index, Proposal { term: self.term, reply });
        self.broadcast_entries();
        self.advance_commit().await
    }

    /// Why the reads of `request` are stale, if they are.
    ///
    /// A read conflicts with any write to its range after `base_index`:
    /// applied writes are found in the version history, the rest in the
    /// unapplied log suffix.
    async fn find_conflict(&self, request: &CommitRequest) -> Option<String> {
        let base = request.base_index;
        if let Some(term) = request.base_term {
            if self.term_at(base) != Some(term) {
                return Some(format!("snapshot entry {base} was replaced"));
            }
        }
        if request.reads.is_empty() {
            return None;
        }
        if base > self.last_index() {
            return Some(format!("snapshot index {base} is ahead of the leader log"));
        }
        if base < self.last_applied {
            let sm = self.store.read().await;
            if base < sm.horizon() {
                return Some(format!("history at index {base} was compacted"));
            }
            if let Some(range) = request.reads.iter().find(|r| sm.changed_since(r, base)) {
                return Some(format!("{range:?} was written after index {base}"));
            }
        }
        let from = base.max(self.last_applied) + 1;
        (from..=self.last_index()).find_map(|index| {
            let entry = self.entry(index)?;
            entry
                .mutations()
                .iter()
                .any(|m| request.reads.intersects(&m.range()))
                .then(|| format!("entry {index} writes to the read set"))
        })
    }

    /// Queue a linearizable read. It completes once a majority has confirmed
    /// this node is still leader and the read index has been committed.
    fn read_index(&mut self, waiter: ReadWaiter) {
        let index = self.commit_index.max(self.term_start_index);
        self.heartbeat(Instant::now());
        self.pending_reads.push(PendingRead { round: self.round, index, waiter });
        self.check_reads();
    }

    fn check_reads(&mut self) {
        if self.role != Role::Leader || self.pending_reads.is_empty() {
            return;
        }
        let confirmed = self.confirmed_round();
        let commit = self.commit_index;
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .pending_reads
            .drain(..)
            .partition(|r| r.round <= confirmed && r.index <= commit);
        self.pending_reads = waiting;
        for read in ready {
            read.waiter.complete(read.index);
        }
    }

    fn uncommitted_view(&self) -> UncommittedView {
        let applied_index = self.last_applied;
        let pending = (applied_index + 1..=self.last_index())
            .filter_map(|i| self.entry(i))
            .flat_map(|e| e.mutations().iter().cloned())
            .collect();
        UncommittedView {
            base_index: self.last_index(),
            base_term: self.last_term(),
            applied_index,
            pending,
            pin: self.pins.pin(applied_index),
        }
    }

    async fn change_membership(
        &mut self,
        change: ConfigChange,
        reply: Reply<CommitResult>,
    ) -> Result<(), RkvError> {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader_error()));
            return Ok(());
        }
        if self.config_index > self.commit_index {
            let _ = reply.send(Err(RkvError::InvalidState("a membership change is in progress".into())));
            return Ok(());
        }
        let next = match self.config.apply(&change) {
            Ok(next) => next,
            Err(e) => {
                let _ = reply.send(Err(e));
                return Ok(());
            }
        };
        info!(node_id = self.id, ?change, "proposing membership change");
        let index = self.last_index() + 1;
        let entry = LogEntry::new(index, self.term, LogPayload::Config(next));
        if let Err(e) = self.append_local(vec![entry]).await {
            let _ = reply.send(Err(e));
            return Ok(());
        }
        self.proposals.insert(index, Proposal { term: self.term, reply });
        self.broadcast_entries();
        self.advance_commit().await
    }

    // -----------------------------------------------------------------------
    // Forwarding (follower)
    // -----------------------------------------------------------------------

    fn leader_target(&self) -> Result<(NodeId, String), RkvError> {
        self.leader
            .filter(|id| *id != self.id)
            .and_then(|id| self.config.addr(id).map(|addr| (id, addr.to_string())))
            .ok_or_else(|| self.not_leader_error())
    }

    fn forward_commit(&self, request: CommitRequest, reply: Reply<CommitResult>) {
        let (leader, addr) = match self.leader_target() {
            Ok(target) => target,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let transport = self.transport.clone();
        let timeout = self.cfg.commit_timeout;
        tokio::spawn(async move {
            let result = forward(&*transport, leader, &addr, RaftRequest::ForwardCommit(request), timeout)
                .await
                .and_then(|response| match response {
                    RaftResponse::Commit(result) => Ok(result),
                    other => Err(unexpected(&other)),
                });
            let _ = reply.send(result);
        });
    }

    fn forward_read_index(&self, reply: Reply<u64>) {
        let (leader, addr) = match self.leader_target() {
            Ok(target) => target,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let transport = self.transport.clone();
        let attempts = self.cfg.forward_attempts.max(1);
        let timeout = self.cfg.commit_timeout / attempts;
        let mut backoff = self.cfg.backoff_initial;
        let backoff_max = self.cfg.backoff_max;
        tokio::spawn(async move {
            let mut result = Err(RkvError::Timeout);
            for attempt in 0..attempts {
                if attempt > 0 {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(backoff_max);
                }
                result = forward(&*transport, leader, &addr, RaftRequest::ForwardReadIndex, timeout)
                    .await
                    .and_then(|response| match response {
                        RaftResponse::ReadIndex(index) => Ok(index),
                        other => Err(unexpected(&other)),
                    });
                if !matches!(result, Err(RkvError::Timeout) | Err(RkvError::Unreachable(_))) {
                    break;
                }
            }
            let _ = reply.send(result);
        });
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    fn publish(&self) {
        let mut config = self.config.clone();
        config.leader_hint = self.leader;
        let status = NodeStatus {
            id: self.id,
            role: self.role,
            term: self.term,
            leader: self.leader,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_index(),
            last_log_term: self.last_term(),
            snapshot_index: self.snapshot_index,
            config,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn forward<T: Transport>(
    transport: &T,
    leader: NodeId,
    addr: &str,
    request: RaftRequest,
    timeout: Duration,
) -> Result<RaftResponse, RkvError> {
    match tokio::time::timeout(timeout, transport.call(leader, addr, request)).await {
        Ok(result) => result,
        Err(_) => Err(RkvError::Timeout),
    }
}

fn unexpected(response: &RaftResponse) -> RkvError {
    RkvError::Consensus(format!("unexpected {} response", response.kind()))
}
