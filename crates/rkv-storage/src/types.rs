use rkv_types::{ClusterConfig, Mutation, NodeId, RkvError};

/// A single entry in the Raft log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: LogPayload,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, payload: LogPayload) -> Self {
        LogEntry { index, term, payload }
    }

    /// Mutations carried by the entry; empty for blank and config entries.
    pub fn mutations(&self) -> &[Mutation] {
        match &self.payload {
            LogPayload::Write(mutations) => mutations,
            LogPayload::Blank | LogPayload::Config(_) => &[],
        }
    }
}

/// The payload carried by a `LogEntry`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LogPayload {
    /// No-op appended by a new leader so entries from earlier terms can commit.
    Blank,
    /// The write set of one committed transaction.
    Write(Vec<Mutation>),
    /// The complete membership that takes effect once this entry is appended.
    Config(ClusterConfig),
}

/// Term and vote, persisted before answering any RPC that changed them.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Current extent of the log.
///
/// Entries live at `snapshot_index + 1 ..= last_index`. With no entries after
/// the snapshot, `last_index == snapshot_index`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogState {
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    pub last_index: u64,
    pub last_term: u64,
}

/// Metadata identifying a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Membership as of `last_included_index`.
    pub config: ClusterConfig,
    /// UUID v4 string identifying this snapshot.
    pub snapshot_id: String,
}

/// A compacted state image replacing the log prefix up to
/// `meta.last_included_index`. `data` is produced by
/// [`MvccStore::snapshot_image`](crate::MvccStore::snapshot_image).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

pub(crate) fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, RkvError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| RkvError::Storage(e.to_string()))
}

pub(crate) fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, RkvError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| RkvError::Storage(e.to_string()))
}

/// Checks an append against the local tail.
///
/// `prev_term_found` is the local term at `prev_index`, if any.
pub(crate) fn check_append(
    state: &LogState,
    prev_index: u64,
    prev_term: u64,
    prev_term_found: Option<u64>,
    entries: &[LogEntry],
) -> Result<(), RkvError> {
    if prev_index != state.last_index || prev_term != state.last_term {
        return Err(RkvError::LogInconsistency {
            index: prev_index,
            expected_term: prev_term,
            actual_term: prev_term_found,
        });
    }
    let mut expected = prev_index + 1;
    let mut term = prev_term;
    for entry in entries {
        if entry.index != expected {
            return Err(RkvError::InvalidArgument(format!(
                "non-contiguous append: expected index {expected}, got {}",
                entry.index
            )));
        }
        if entry.term < term {
            return Err(RkvError::InvalidArgument(format!(
                "term regression at index {}: {} < {term}",
                entry.index, entry.term
            )));
        }
        expected += 1;
        term = entry.term;
    }
    Ok(())
}
