use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use rkv_storage::Snapshot;
use rkv_types::{NodeId, RkvError};

use crate::config::RaftConfig;
use crate::engine::{Event, Sent};
use crate::message::{RaftRequest, RaftResponse, SnapshotChunk};
use crate::transport::Transport;

pub(crate) enum PeerJob {
    Rpc { request: RaftRequest, sent: Sent },
    Snapshot { term: u64, leader_id: NodeId, snapshot: Arc<Snapshot> },
}

impl PeerJob {
    fn is_vote(&self) -> bool {
        matches!(self, PeerJob::Rpc { sent: Sent::Vote { .. }, .. })
    }
}

/// Keep only the newest vote request. Older ones belong to elections that are
/// already over, and an unreachable peer would otherwise collect one per
/// election timeout.
fn drop_stale_votes(queue: &mut VecDeque<PeerJob>) {
    let Some(newest) = queue.iter().rposition(PeerJob::is_vote) else { return };
    let mut position = 0;
    queue.retain(|job| {
        let keep = !job.is_vote() || position == newest;
        position += 1;
        keep
    });
}

/// Sends the engine's requests to one peer, one at a time, and reports each
/// outcome back as an [`Event::Peer`]. After a failure the next request waits
/// for an exponential backoff.
pub(crate) struct PeerWorker {
    pub(crate) addr: String,
    jobs: mpsc::UnboundedSender<PeerJob>,
    task: JoinHandle<()>,
}

#[derive(Clone, Copy)]
struct Limits {
    rpc_timeout: Duration,
    chunk_bytes: usize,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl PeerWorker {
    pub(crate) fn spawn<T: Transport>(
        peer: NodeId,
        addr: String,
        transport: Arc<T>,
        events: mpsc::UnboundedSender<Event>,
        cfg: &RaftConfig,
    ) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let limits = Limits {
            rpc_timeout: cfg.rpc_timeout,
            chunk_bytes: cfg.snapshot_chunk_bytes,
            backoff_initial: cfg.backoff_initial,
            backoff_max: cfg.backoff_max,
        };
        let task = tokio::spawn(run(peer, addr.clone(), transport, events, rx, limits));
        PeerWorker { addr, jobs, task }
    }

    pub(crate) fn send(&self, job: PeerJob) {
        // The task only exits once the engine is gone.
        let _ = self.jobs.send(job);
    }
}

impl Drop for PeerWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<T: Transport>(
    peer: NodeId,
    addr: String,
    transport: Arc<T>,
    events: mpsc::UnboundedSender<Event>,
    mut jobs: mpsc::UnboundedReceiver<PeerJob>,
    limits: Limits,
) {
    let mut backoff = Duration::ZERO;
    let mut queue = VecDeque::new();
    loop {
        if queue.is_empty() {
            match jobs.recv().await {
                Some(job) => queue.push_back(job),
                None => break,
            }
        }
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
        while let Ok(job) = jobs.try_recv() {
            queue.push_back(job);
        }
        drop_stale_votes(&mut queue);
        let Some(job) = queue.pop_front() else { continue };
        let (sent, result) = match job {
            PeerJob::Rpc { request, sent } => {
                (sent, call(&*transport, peer, &addr, request, limits.rpc_timeout).await)
            }
            PeerJob::Snapshot { term, leader_id, snapshot } => {
                let sent = Sent::Snapshot { term, last_included_index: snapshot.meta.last_included_index };
                (sent, send_snapshot(&*transport, peer, &addr, term, leader_id, &snapshot, limits).await)
            }
        };
        backoff = match &result {
            Ok(_) => Duration::ZERO,
            Err(e) => {
                debug!(peer, error = %e, "peer rpc failed");
                next_backoff(backoff, limits.backoff_initial, limits.backoff_max)
            }
        };
        if events.send(Event::Peer { peer, sent, result }).is_err() {
            break;
        }
    }
}

fn next_backoff(current: Duration, initial: Duration, max: Duration) -> Duration {
    if current.is_zero() { initial } else { (current * 2).min(max) }
}

async fn call<T: Transport>(
    transport: &T,
    peer: NodeId,
    addr: &str,
    request: RaftRequest,
    timeout: Duration,
) -> Result<RaftResponse, RkvError> {
    match tokio::time::timeout(timeout, transport.call(peer, addr, request)).await {
        Ok(result) => result,
        Err(_) => Err(RkvError::Timeout),
    }
}

/// Stream `snapshot` in chunks. Returns the first unsuccessful response, or
/// the response to the final chunk.
async fn send_snapshot<T: Transport>(
    transport: &T,
    peer: NodeId,
    addr: &str,
    term: u64,
    leader_id: NodeId,
    snapshot: &Snapshot,
    limits: Limits,
) -> Result<RaftResponse, RkvError> {
    let data = &snapshot.data;
    let mut offset = 0usize;
    loop {
        let end = (offset + limits.chunk_bytes).min(data.len());
        let chunk = SnapshotChunk {
            term,
            leader_id,
            snapshot_id: snapshot.meta.snapshot_id.clone(),
            last_included_index: snapshot.meta.last_included_index,
            last_included_term: snapshot.meta.last_included_term,
            config: snapshot.meta.config.clone(),
            offset: offset as u64,
            data: data[offset..end].to_vec(),
            done: end == data.len(),
        };
        let done = chunk.done;
        let response =
            call(transport, peer, addr, RaftRequest::InstallSnapshot(chunk), limits.rpc_timeout).await?;
        match &response {
            RaftResponse::InstallSnapshot(r) if r.success && !done => offset = end,
            _ => return Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::VoteRequest;

    fn vote(term: u64) -> PeerJob {
        PeerJob::Rpc {
            request: RaftRequest::Vote(VoteRequest { term, candidate_id: 1, last_log_index: 0, last_log_term: 0 }),
            sent: Sent::Vote { term },
        }
    }

    fn term_of(job: &PeerJob) -> u64 {
        match job {
            PeerJob::Rpc { sent: Sent::Vote { term } | Sent::Append { term, .. } | Sent::Snapshot { term, .. }, .. } => {
                *term
            }
            PeerJob::Snapshot { term, .. } => *term,
        }
    }

    #[test]
    fn queued_votes_collapse_to_the_newest() {
        let append = PeerJob::Rpc {
            request: RaftRequest::Vote(VoteRequest { term: 2, candidate_id: 1, last_log_index: 0, last_log_term: 0 }),
            sent: Sent::Append { term: 2, prev_index: 0, round: 1 },
        };
        let mut queue: VecDeque<PeerJob> = (1..=5).map(vote).collect();
        queue.insert(2, append);
        drop_stale_votes(&mut queue);
        assert_eq!(queue.len(), 2);
        assert!(!queue[0].is_vote());
        assert_eq!(queue.iter().map(term_of).collect::<Vec<_>>(), vec![2, 5]);

        let mut empty = VecDeque::new();
        drop_stale_votes(&mut empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let initial = Duration::from_millis(10);
        let max = Duration::from_millis(35);
        let b1 = next_backoff(Duration::ZERO, initial, max);
        let b2 = next_backoff(b1, initial, max);
        let b3 = next_backoff(b2, initial, max);
        assert_eq!((b1, b2, b3), (initial, Duration::from_millis(20), max));
    }
}
