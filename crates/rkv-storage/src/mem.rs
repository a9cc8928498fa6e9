use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, trace};

use rkv_types::RkvError;

use crate::traits::LogStorage;
use crate::types::{check_append, HardState, LogEntry, LogState, Snapshot};

// ---------------------------------------------------------------------------
// MemLogStorage
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemLogInner {
    entries: BTreeMap<u64, LogEntry>,
    hard_state: HardState,
    snapshot: Option<Snapshot>,
}

impl MemLogInner {
    fn state(&self) -> LogState {
        let (snapshot_index, snapshot_term) = self
            .snapshot
            .as_ref()
            .map(|s| (s.meta.last_included_index, s.meta.last_included_term))
            .unwrap_or((0, 0));
        let (last_index, last_term) = self
            .entries
            .values()
            .next_back()
            .map(|e| (e.index, e.term))
            .unwrap_or((snapshot_index, snapshot_term));
        LogState { snapshot_index, snapshot_term, last_index, last_term }
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if let Some(entry) = self.entries.get(&index) {
            return Some(entry.term);
        }
        let state = self.state();
        (index == state.snapshot_index).then_some(state.snapshot_term)
    }
}

/// In-memory `LogStorage` backed by a `BTreeMap`.
///
/// Clones share the same log, which lets tests restart a node on the state it
/// had "persisted". Not durable across process restarts.
#[derive(Clone, Default)]
pub struct MemLogStorage {
    inner: Arc<RwLock<MemLogInner>>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        MemLogStorage::default()
    }
}

impl LogStorage for MemLogStorage {
    async fn log_state(&self) -> Result<LogState, RkvError> {
        Ok(self.inner.read().await.state())
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>, RkvError> {
        Ok(self.inner.read().await.entries.get(&index).cloned())
    }

    async fn read_range(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogEntry>, RkvError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let g = self.inner.read().await;
        Ok(g.entries.range(from..=to_inclusive).map(|(_, e)| e.clone()).collect())
    }

    async fn append(
        &self,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
    ) -> Result<u64, RkvError> {
        let mut g = self.inner.write().await;
        let state = g.state();
        check_append(&state, prev_index, prev_term, g.term_at(prev_index), &entries)?;
        let mut last = state.last_index;
        for entry in entries {
            last = entry.index;
            g.entries.insert(entry.index, entry);
        }
        Ok(last)
    }

    async fn truncate_suffix(&self, from_index: u64) -> Result<(), RkvError> {
        let mut g = self.inner.write().await;
        let state = g.state();
        if from_index <= state.snapshot_index {
            return Err(RkvError::InvalidArgument(format!(
                "cannot truncate at {from_index}: compacted through {}",
                state.snapshot_index
            )));
        }
        let removed = g.entries.split_off(&from_index).len();
        trace!(from_index, removed, "truncated log suffix");
        Ok(())
    }

    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), RkvError> {
        let mut g = self.inner.write().await;
        let index = snapshot.meta.last_included_index;
        let keep_suffix = g.term_at(index) == Some(snapshot.meta.last_included_term);
        if keep_suffix {
            g.entries = g.entries.split_off(&(index + 1));
        } else {
            g.entries.clear();
        }
        g.snapshot = Some(snapshot);
        debug!(index, keep_suffix, "installed snapshot");
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<Snapshot>, RkvError> {
        Ok(self.inner.read().await.snapshot.clone())
    }

    async fn save_hard_state(&self, state: HardState) -> Result<(), RkvError> {
        self.inner.write().await.hard_state = state;
        Ok(())
    }

    async fn read_hard_state(&self) -> Result<HardState, RkvError> {
        Ok(self.inner.read().await.hard_state.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
