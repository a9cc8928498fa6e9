use std::time::Duration;

use tracing::debug;

use rkv_consensus::RaftHandle;
use rkv_storage::SnapshotPin;
use rkv_types::{
    CommitRequest, CommitResult, Consistency, KeyRange, Mutation, RkvError, StoreKind, TxState,
};

use crate::buffer::{layered_get, layered_scan, observed_range, TxCore, WriteBuffer};
use crate::{KvDatabase, KvTransaction, TxOptions};

/// Transactions against the replicated store of one node.
#[derive(Clone)]
pub struct RaftKvDatabase {
    raft: RaftHandle,
}

impl RaftKvDatabase {
    pub fn new(raft: RaftHandle) -> Self {
        RaftKvDatabase { raft }
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    /// Pin `index` so compaction keeps it readable.
    async fn pin(&self, index: u64) -> Result<SnapshotPin, RkvError> {
        let sm = self.raft.store().read().await;
        if index < sm.horizon() {
            return Err(RkvError::Conflict(format!("index {index} is no longer readable")));
        }
        Ok(self.raft.pins().pin(index))
    }
}

impl KvDatabase for RaftKvDatabase {
    type Tx = RaftTransaction;

    fn kind(&self) -> StoreKind {
        StoreKind::Raft
    }

    async fn begin(&self, options: TxOptions) -> Result<RaftTransaction, RkvError> {
        let timeout = options.timeout.unwrap_or_else(|| self.raft.commit_timeout());
        let mut read_at = None;
        let mut base_term = None;
        let mut pending = None;
        let (base_index, pin) = match options.consistency {
            Consistency::Uncommitted => {
                let view = self.raft.uncommitted_view().await?;
                read_at = Some(view.applied_index);
                base_term = Some(view.base_term);
                pending = Some(view.pending.into_iter().collect::<WriteBuffer>());
                (view.base_index, view.pin)
            }
            Consistency::Eventual => {
                let sm = self.raft.store().read().await;
                let applied = sm.applied_index();
                (applied, self.raft.pins().pin(applied))
            }
            Consistency::EventualCommitted => {
                let commit = self.raft.status().commit_index;
                let pin = self.pin(commit).await?;
                self.raft.wait_applied(commit, timeout).await?;
                (commit, pin)
            }
            Consistency::Linearizable => {
                let index = tokio::time::timeout(timeout, self.raft.read_index())
                    .await
                    .map_err(|_| RkvError::Timeout)??;
                let pin = self.pin(index).await?;
                self.raft.wait_applied(index, timeout).await?;
                (index, pin)
            }
        };
        debug!(consistency = %options.consistency, base_index, "raft transaction started");
        Ok(RaftTransaction {
            raft: self.raft.clone(),
            core: TxCore::new(options.consistency, base_index, timeout, Some(pin)),
            read_at: read_at.unwrap_or(base_index),
            base_term,
            pending: pending.unwrap_or_default(),
        })
    }
}

/// A transaction reading a pinned state of the replicated store.
///
/// UNCOMMITTED transactions read the applied state overlaid with the
/// node's unapplied log entries and commit against the last log entry they
/// saw, so they fail if that entry is replaced.
#[derive(Debug)]
pub struct RaftTransaction {
    raft: RaftHandle,
    core: TxCore,
    /// State machine index reads are served at.
    read_at: u64,
    base_term: Option<u64>,
    pending: WriteBuffer,
}

impl RaftTransaction {
    async fn commit_writes(&mut self, remaining: Duration) -> Result<CommitResult, RkvError> {
        let writes = self.core.writes.take_mutations();
        let reads = std::mem::take(&mut self.core.reads);
        if writes.is_empty() {
            let validate = self.core.consistency == Consistency::Linearizable && !reads.is_empty();
            if !validate {
                return Ok(CommitResult { index: self.core.base_index, term: 0 });
            }
        }
        let request = CommitRequest {
            base_index: self.core.base_index,
            base_term: self.base_term,
            reads,
            writes,
        };
        let started = tokio::time::Instant::now();
        let result = tokio::time::timeout(remaining, self.raft.commit(request))
            .await
            .map_err(|_| RkvError::Timeout)??;
        // Read-your-writes on this node; the commit itself already succeeded.
        let left = remaining.saturating_sub(started.elapsed());
        if let Err(e) = self.raft.wait_applied(result.index, left).await {
            debug!(index = result.index, error = %e, "committed entry not yet applied locally");
        }
        Ok(result)
    }

    fn check_readable(&self, horizon: u64) -> Result<(), RkvError> {
        if self.read_at < horizon {
            return Err(RkvError::Conflict(format!(
                "state at index {} was replaced by a snapshot",
                self.read_at
            )));
        }
        Ok(())
    }
}

impl KvTransaction for RaftTransaction {
    fn kind(&self) -> StoreKind {
        StoreKind::Raft
    }

    fn consistency(&self) -> Consistency {
        self.core.consistency
    }

    fn state(&self) -> TxState {
        self.core.state
    }

    fn base_index(&self) -> u64 {
        self.core.base_index
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, RkvError> {
        self.core.check_open()?;
        if let Some(own) = self.core.writes.lookup(key) {
            return Ok(own.map(<[u8]>::to_vec));
        }
        self.core.reads.add(KeyRange::single(key));
        let sm = self.raft.store().read().await;
        self.check_readable(sm.horizon())?;
        Ok(layered_get(&sm, self.read_at, &[&self.pending], key))
    }

    async fn scan(&mut self, range: KeyRange, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RkvError> {
        self.core.check_open()?;
        let rows = {
            let sm = self.raft.store().read().await;
            self.check_readable(sm.horizon())?;
            layered_scan(&sm, self.read_at, &[&self.core.writes, &self.pending], &range, limit)
        };
        self.core.reads.add(observed_range(&range, &rows, limit));
        Ok(rows)
    }

    fn write(&mut self, mutation: Mutation) -> Result<(), RkvError> {
        self.core.write(mutation)
    }

    async fn commit(&mut self) -> Result<CommitResult, RkvError> {
        let remaining = self.core.begin_commit()?;
        let result = self.commit_writes(remaining).await;
        self.core.finish(&result);
        result
    }

    fn rollback(&mut self) {
        self.core.close();
    }
}
