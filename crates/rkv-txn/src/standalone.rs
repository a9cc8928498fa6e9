use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};

use rkv_storage::{FjallKvStore, MvccStore, SnapshotPins};
use rkv_types::{
    CommitResult, Consistency, KeyRange, KeyRanges, Mutation, RkvError, StoreKind, TxState,
};

use crate::buffer::{layered_get, layered_scan, observed_range, TxCore};
use crate::{KvDatabase, KvTransaction, TxOptions};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const HISTORY_RETENTION: u64 = 1024;

struct StandaloneInner {
    store: RwLock<MvccStore>,
    pins: SnapshotPins,
    durable: Option<FjallKvStore>,
}

/// A non-replicated store with the same transactional contract as the
/// replicated one. Versions are a local commit counter.
#[derive(Clone)]
pub struct StandaloneKvDatabase {
    inner: Arc<StandaloneInner>,
}

impl StandaloneKvDatabase {
    pub fn in_memory() -> Self {
        Self::with_store(MvccStore::new(), None)
    }

    /// Open over the fjall `standalone` keyspace, reloading what it holds.
    pub async fn open(durable: FjallKvStore) -> Result<Self, RkvError> {
        let (version, pairs) = durable.load().await?;
        info!(version, keys = pairs.len(), "standalone store opened");
        Ok(Self::with_store(MvccStore::from_pairs(pairs, version, 0), Some(durable)))
    }

    fn with_store(store: MvccStore, durable: Option<FjallKvStore>) -> Self {
        StandaloneKvDatabase {
            inner: Arc::new(StandaloneInner { store: RwLock::new(store), pins: SnapshotPins::new(), durable }),
        }
    }

    /// The last committed version.
    pub async fn version(&self) -> u64 {
        self.inner.store.read().await.applied_index()
    }

    /// Every live pair as of the last commit.
    pub async fn export(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let sm = self.inner.store.read().await;
        sm.scan(&KeyRange::all(), sm.applied_index(), usize::MAX)
    }

    pub async fn is_empty(&self) -> bool {
        let sm = self.inner.store.read().await;
        sm.scan(&KeyRange::all(), sm.applied_index(), 1).is_empty()
    }

    /// Delete every key in one commit. Open transactions that read anything
    /// will conflict.
    pub async fn clear(&self) -> Result<(), RkvError> {
        self.replace(Vec::new()).await
    }

    /// Replace the whole key space with `pairs` in one commit.
    pub async fn replace(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), RkvError> {
        let mut sm = self.inner.store.write().await;
        let version = sm.applied_index() + 1;
        let mut writes = vec![Mutation::DeleteRange { range: KeyRange::all() }];
        writes.extend(pairs.into_iter().map(|(key, value)| Mutation::Put { key, value }));
        if let Some(durable) = &self.inner.durable {
            durable.clear().await?;
            durable.apply(version, writes[1..].to_vec()).await?;
        }
        sm.apply(version, 0, &writes)?;
        info!(version, keys = writes.len() - 1, "standalone store replaced");
        Ok(())
    }

    async fn commit(&self, base: u64, reads: &KeyRanges, writes: Vec<Mutation>) -> Result<CommitResult, RkvError> {
        let mut sm = self.inner.store.write().await;
        if !reads.is_empty() {
            if base < sm.horizon() {
                return Err(RkvError::Conflict(format!("history at version {base} was compacted")));
            }
            if let Some(range) = reads.iter().find(|r| sm.changed_since(r, base)) {
                return Err(RkvError::Conflict(format!("{range:?} was written after version {base}")));
            }
        }
        if writes.is_empty() {
            return Ok(CommitResult { index: base, term: 0 });
        }
        let version = sm.applied_index() + 1;
        if let Some(durable) = &self.inner.durable {
            durable.apply(version, writes.clone()).await?;
        }
        sm.apply(version, 0, &writes)?;

        let retained = version.saturating_sub(HISTORY_RETENTION);
        let horizon = self.inner.pins.oldest().map_or(retained, |pin| pin.min(retained));
        if horizon > sm.horizon() + HISTORY_RETENTION / 2 {
            sm.compact(horizon);
        }
        debug!(version, writes = writes.len(), "standalone commit");
        Ok(CommitResult { index: version, term: 0 })
    }
}

impl KvDatabase for StandaloneKvDatabase {
    type Tx = StandaloneTransaction;

    fn kind(&self) -> StoreKind {
        StoreKind::Standalone
    }

    async fn begin(&self, options: TxOptions) -> Result<StandaloneTransaction, RkvError> {
        let (base, pin) = {
            let sm = self.inner.store.read().await;
            let base = sm.applied_index();
            (base, self.inner.pins.pin(base))
        };
        let timeout = options.timeout.unwrap_or(DEFAULT_TIMEOUT);
        Ok(StandaloneTransaction {
            db: self.clone(),
            core: TxCore::new(options.consistency, base, timeout, Some(pin)),
        })
    }
}

/// A transaction on the standalone store. Every consistency level reads the
/// latest local commit as of begin.
pub struct StandaloneTransaction {
    db: StandaloneKvDatabase,
    core: TxCore,
}

impl fmt::Debug for StandaloneTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandaloneTransaction").field("core", &self.core).finish_non_exhaustive()
    }
}

impl KvTransaction for StandaloneTransaction {
    fn kind(&self) -> StoreKind {
        StoreKind::Standalone
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
        let sm = self.db.inner.store.read().await;
        Ok(layered_get(&sm, self.core.base_index, &[], key))
    }

    async fn scan(&mut self, range: KeyRange, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RkvError> {
        self.core.check_open()?;
        let rows = {
            let sm = self.db.inner.store.read().await;
            layered_scan(&sm, self.core.base_index, &[&self.core.writes], &range, limit)
        };
        self.core.reads.add(observed_range(&range, &rows, limit));
        Ok(rows)
    }

    fn write(&mut self, mutation: Mutation) -> Result<(), RkvError> {
        self.core.write(mutation)
    }

    async fn commit(&mut self) -> Result<CommitResult, RkvError> {
        self.core.begin_commit()?;
        let writes = self.core.writes.take_mutations();
        let reads = std::mem::take(&mut self.core.reads);
        let result = self.db.commit(self.core.base_index, &reads, writes).await;
        self.core.finish(&result);
        result
    }

    fn rollback(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use rkv_storage::FjallStore;

    use super::*;

    fn opts() -> TxOptions {
        TxOptions::new(Consistency::Linearizable)
    }

    #[tokio::test]
    async fn reads_see_own_writes_and_commit() {
        let db = StandaloneKvDatabase::in_memory();
        let mut tx = db.begin(opts()).await.unwrap();
        assert_eq!(tx.kind(), StoreKind::Standalone);
        tx.put("a", "1").unwrap();
        assert_eq!(tx.get(b"a").await.unwrap(), Some(b"1".to_vec()));
        let result = tx.commit().await.unwrap();
        assert_eq!(result.index, 1);
        assert_eq!(tx.state(), TxState::Committed);
        assert!(tx.put("b", "2").is_err());

        let mut tx = db.begin(opts()).await.unwrap();
        assert_eq!(tx.base_index(), 1);
        assert_eq!(tx.get(b"a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn overlapping_transactions_conflict() {
        let db = StandaloneKvDatabase::in_memory();
        let mut seed = db.begin(opts()).await.unwrap();
        seed.put("x", "0").unwrap();
        seed.commit().await.unwrap();

        let mut a = db.begin(opts()).await.unwrap();
        let mut b = db.begin(opts()).await.unwrap();
        assert_eq!(a.get(b"x").await.unwrap(), Some(b"0".to_vec()));
        assert_eq!(b.get(b"x").await.unwrap(), Some(b"0".to_vec()));
        a.put("x", "a").unwrap();
        b.put("x", "b").unwrap();

        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(b.state(), TxState::Closed);
    }

    #[tokio::test]
    async fn rollback_leaves_no_trace() {
        let db = StandaloneKvDatabase::in_memory();
        let mut tx = db.begin(opts()).await.unwrap();
        tx.put("a", "1").unwrap();
        tx.rollback();
        assert_eq!(tx.state(), TxState::Closed);
        assert!(tx.commit().await.is_err());
        assert_eq!(db.version().await, 0);
        assert!(db.is_empty().await);
    }

    #[tokio::test]
    async fn durable_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FjallStore::open(dir.path()).unwrap();
            let db = StandaloneKvDatabase::open(FjallKvStore(store)).await.unwrap();
            let mut tx = db.begin(opts()).await.unwrap();
            tx.put("a", "1").unwrap();
            tx.put("b", "2").unwrap();
            tx.commit().await.unwrap();
            let mut tx = db.begin(opts()).await.unwrap();
            tx.delete("a").unwrap();
            tx.commit().await.unwrap();
        }
        let store = FjallStore::open(dir.path()).unwrap();
        let db = StandaloneKvDatabase::open(FjallKvStore(store)).await.unwrap();
        assert_eq!(db.version().await, 2);
        assert_eq!(db.export().await, vec![(b"b".to_vec(), b"2".to_vec())]);

        db.clear().await.unwrap();
        assert!(db.is_empty().await);
    }

    #[tokio::test]
    async fn replace_conflicts_with_open_readers() {
        let db = StandaloneKvDatabase::in_memory();
        let mut reader = db.begin(opts()).await.unwrap();
        assert_eq!(reader.get(b"k").await.unwrap(), None);
        reader.put("other", "1").unwrap();

        db.replace(vec![(b"k".to_vec(), b"v".to_vec())]).await.unwrap();
        assert_eq!(db.export().await, vec![(b"k".to_vec(), b"v".to_vec())]);
        assert!(reader.commit().await.unwrap_err().is_conflict());
    }
}
