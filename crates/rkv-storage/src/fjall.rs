use std::path::Path;
use std::sync::Arc;

use rkv_types::{Mutation, RkvError};
use tracing::debug;

use crate::keys::{
    raft_log_key, META_HARD_STATE, META_SNAPSHOT, META_STANDALONE_VERSION,
    SNAPSHOT_IMAGE,
};
use crate::traits::LogStorage;
use crate::types::{
    check_append, decode, encode, HardState, LogEntry, LogState, Snapshot, SnapshotMeta,
};

fn fjall_err(e: fjall::Error) -> RkvError {
    RkvError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> RkvError {
    RkvError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping all keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic. Every write is followed by a `SyncAll` persist
/// before the caller is answered.
pub struct FjallStore {
    /// The underlying fjall database.
    pub db: fjall::Database,
    /// Raft log entries: `index(8)` → bincode(LogEntry)
    pub raft_log: fjall::Keyspace,
    /// Hard state, snapshot metadata, standalone version: label → bincode(value)
    pub meta: fjall::Keyspace,
    /// Latest snapshot image under [`SNAPSHOT_IMAGE`].
    pub snapshot: fjall::Keyspace,
    /// Flat user data of the standalone store: raw key → raw value
    pub standalone: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, RkvError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let raft_log =
            db.keyspace("raft_log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let snapshot =
            db.keyspace("snapshot", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let standalone =
            db.keyspace("standalone", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, raft_log, meta, snapshot, standalone }))
    }

    fn sync(&self) -> Result<(), RkvError> {
        self.db.persist(fjall::PersistMode::SyncAll).map_err(fjall_err)
    }

    fn snapshot_meta(&self) -> Result<Option<SnapshotMeta>, RkvError> {
        match self.meta.get(META_SNAPSHOT).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<SnapshotMeta>(&b)?)),
            None => Ok(None),
        }
    }

    fn log_state(&self) -> Result<LogState, RkvError> {
        let (snapshot_index, snapshot_term) = self
            .snapshot_meta()?
            .map(|m| (m.last_included_index, m.last_included_term))
            .unwrap_or((0, 0));

        let last = match self.raft_log.range(raft_log_key(0)..=raft_log_key(u64::MAX)).next_back() {
            Some(guard) => {
                let (_, v) = guard.into_inner().map_err(fjall_err)?;
                let entry = decode::<LogEntry>(&v)?;
                Some((entry.index, entry.term))
            }
            None => None,
        };
        let (last_index, last_term) = last.unwrap_or((snapshot_index, snapshot_term));
        Ok(LogState { snapshot_index, snapshot_term, last_index, last_term })
    }

    fn term_at(&self, index: u64, state: &LogState) -> Result<Option<u64>, RkvError> {
        if index == state.snapshot_index {
            return Ok(Some(state.snapshot_term));
        }
        match self.raft_log.get(raft_log_key(index)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<LogEntry>(&b)?.term)),
            None => Ok(None),
        }
    }

    fn log_keys_from(&self, from_index: u64) -> Result<Vec<Vec<u8>>, RkvError> {
        self.raft_log
            .range(raft_log_key(from_index)..=raft_log_key(u64::MAX))
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FjallLogStorage
// ---------------------------------------------------------------------------

/// `LogStorage` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct FjallLogStorage(pub Arc<FjallStore>);

impl LogStorage for FjallLogStorage {
    async fn log_state(&self) -> Result<LogState, RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.log_state()).await.map_err(join_err)?
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>, RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<LogEntry>, RkvError> {
            match store.raft_log.get(raft_log_key(index)).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<LogEntry>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn read_range(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogEntry>, RkvError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogEntry>, RkvError> {
            store
                .raft_log
                .range(raft_log_key(from)..=raft_log_key(to_inclusive))
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<LogEntry>(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn append(
        &self,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
    ) -> Result<u64, RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, RkvError> {
            let state = store.log_state()?;
            let found = store.term_at(prev_index, &state)?;
            check_append(&state, prev_index, prev_term, found, &entries)?;
            let Some(last) = entries.last().map(|e| e.index) else {
                return Ok(state.last_index);
            };

            let mut batch = store.db.batch();
            for entry in &entries {
                batch.insert(&store.raft_log, raft_log_key(entry.index).to_vec(), encode(entry)?);
            }
            batch.commit().map_err(fjall_err)?;
            store.sync()?;
            Ok(last)
        })
        .await
        .map_err(join_err)?
    }

    async fn truncate_suffix(&self, from_index: u64) -> Result<(), RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RkvError> {
            let state = store.log_state()?;
            if from_index <= state.snapshot_index {
                return Err(RkvError::InvalidArgument(format!(
                    "cannot truncate at {from_index}: compacted through {}",
                    state.snapshot_index
                )));
            }
            let keys = store.log_keys_from(from_index)?;
            if keys.is_empty() {
                return Ok(());
            }
            let removed = keys.len();
            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.raft_log, k);
            }
            batch.commit().map_err(fjall_err)?;
            debug!(from_index, removed, "truncated log suffix");
            store.sync()
        })
        .await
        .map_err(join_err)?
    }

    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RkvError> {
            let state = store.log_state()?;
            let index = snapshot.meta.last_included_index;
            let keep_suffix =
                store.term_at(index, &state)? == Some(snapshot.meta.last_included_term);

            let mut batch = store.db.batch();
            for guard in store.raft_log.range(raft_log_key(0)..=raft_log_key(index)) {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                batch.remove(&store.raft_log, k.to_vec());
            }
            if !keep_suffix {
                for k in store.log_keys_from(index + 1)? {
                    batch.remove(&store.raft_log, k);
                }
            }
            batch.insert(&store.meta, META_SNAPSHOT.to_vec(), encode(&snapshot.meta)?);
            let bytes = snapshot.data.len();
            batch.insert(&store.snapshot, SNAPSHOT_IMAGE.to_vec(), snapshot.data);
            batch.commit().map_err(fjall_err)?;
            debug!(index, bytes, keep_suffix, "installed snapshot and compacted log");
            store.sync()
        })
        .await
        .map_err(join_err)?
    }

    async fn load_snapshot(&self) -> Result<Option<Snapshot>, RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Snapshot>, RkvError> {
            let Some(meta) = store.snapshot_meta()? else {
                return Ok(None);
            };
            let data = store
                .snapshot
                .get(SNAPSHOT_IMAGE)
                .map_err(fjall_err)?
                .ok_or_else(|| RkvError::Storage("snapshot metadata without image".into()))?;
            Ok(Some(Snapshot { meta, data: data.to_vec() }))
        })
        .await
        .map_err(join_err)?
    }

    async fn save_hard_state(&self, state: HardState) -> Result<(), RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RkvError> {
            store.meta.insert(META_HARD_STATE.to_vec(), encode(&state)?).map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(join_err)?
    }

    async fn read_hard_state(&self) -> Result<HardState, RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<HardState, RkvError> {
            match store.meta.get(META_HARD_STATE).map_err(fjall_err)? {
                Some(b) => decode::<HardState>(&b),
                None => Ok(HardState::default()),
            }
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// FjallKvStore
// ---------------------------------------------------------------------------

/// Durable flat key space of the standalone store.
///
/// Holds only the latest value of each key plus the standalone commit
/// counter; version history lives in memory.
#[derive(Clone)]
pub struct FjallKvStore(pub Arc<FjallStore>);

impl FjallKvStore {
    /// All stored pairs in key order, with the last written commit version.
    pub async fn load(&self) -> Result<(u64, Vec<(Vec<u8>, Vec<u8>)>), RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(u64, Vec<(Vec<u8>, Vec<u8>)>), RkvError> {
            let version = match store.meta.get(META_STANDALONE_VERSION).map_err(fjall_err)? {
                Some(b) => decode::<u64>(&b)?,
                None => 0,
            };
            let pairs = store
                .standalone
                .range::<&[u8], _>(..)
                .map(|g| g.into_inner().map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(fjall_err))
                .collect::<Result<_, _>>()?;
            Ok((version, pairs))
        })
        .await
        .map_err(join_err)?
    }

    /// Durably apply one committed write set as `version`.
    pub async fn apply(&self, version: u64, mutations: Vec<Mutation>) -> Result<(), RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RkvError> {
            let mut batch = store.db.batch();
            for m in mutations {
                match m {
                    Mutation::Put { key, value } => batch.insert(&store.standalone, key, value),
                    Mutation::Delete { key } => batch.remove(&store.standalone, key),
                    Mutation::DeleteRange { range } => {
                        if range.is_empty() {
                            continue;
                        }
                        let keys: Vec<Vec<u8>> = match range.end {
                            Some(end) => store
                                .standalone
                                .range(range.start..end)
                                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                                .collect::<Result<_, _>>()?,
                            None => store
                                .standalone
                                .range(range.start..)
                                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                                .collect::<Result<_, _>>()?,
                        };
                        for k in keys {
                            batch.remove(&store.standalone, k);
                        }
                    }
                }
            }
            batch.insert(&store.meta, META_STANDALONE_VERSION.to_vec(), encode(&version)?);
            batch.commit().map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(join_err)?
    }

    /// Remove every standalone key. The commit counter is kept.
    pub async fn clear(&self) -> Result<(), RkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RkvError> {
            let keys: Vec<Vec<u8>> = store
                .standalone
                .range::<&[u8], _>(..)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;
            let removed = keys.len();
            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.standalone, k);
            }
            batch.commit().map_err(fjall_err)?;
            debug!(removed, "cleared standalone keyspace");
            store.sync()
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
