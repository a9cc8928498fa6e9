use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type NodeId = u64;

/// Transaction option naming the requested [`Consistency`] level.
pub const OPTION_CONSISTENCY: &str = "consistency";
/// Transaction option overriding the commit timeout, in milliseconds.
pub const OPTION_TIMEOUT_MS: &str = "timeout_ms";

// ---------------------------------------------------------------------------
// Consistency
// ---------------------------------------------------------------------------

/// Read consistency requested when a transaction begins.
///
/// Write transactions always commit through the leader regardless of level;
/// the level only decides which snapshot reads are served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum Consistency {
    /// Latest local log entry, committed or not.
    Uncommitted,
    /// Local last-applied state. May be stale on a lagging follower.
    Eventual,
    /// At least the commit index known to this node at begin time.
    EventualCommitted,
    /// Confirmed by a leader read-index round before any read is served.
    #[default]
    Linearizable,
}

impl Consistency {
    pub fn as_str(self) -> &'static str {
        match self {
            Consistency::Uncommitted => "UNCOMMITTED",
            Consistency::Eventual => "EVENTUAL",
            Consistency::EventualCommitted => "EVENTUAL_COMMITTED",
            Consistency::Linearizable => "LINEARIZABLE",
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Consistency {
    type Err = RkvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "UNCOMMITTED" => Ok(Consistency::Uncommitted),
            "EVENTUAL" => Ok(Consistency::Eventual),
            "EVENTUAL_COMMITTED" => Ok(Consistency::EventualCommitted),
            "LINEARIZABLE" => Ok(Consistency::Linearizable),
            other => Err(RkvError::InvalidArgument(format!("unknown consistency level '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Key ranges
// ---------------------------------------------------------------------------

/// Smallest key strictly greater than `key`.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0x00);
    next
}

/// Half-open byte range `[start, end)`. `end == None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: Option<Vec<u8>>) -> Self {
        KeyRange { start: start.into(), end }
    }

    /// The range containing exactly `key`.
    pub fn single(key: &[u8]) -> Self {
        KeyRange { start: key.to_vec(), end: Some(next_key(key)) }
    }

    /// The whole key space.
    pub fn all() -> Self {
        KeyRange { start: Vec::new(), end: None }
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.end, Some(end) if *end <= self.start)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && self.end.as_deref().map_or(true, |end| key < end)
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let starts_before_other_ends =
            other.end.as_deref().map_or(true, |end| self.start.as_slice() < end);
        let other_starts_before_end =
            self.end.as_deref().map_or(true, |end| other.start.as_slice() < end);
        starts_before_other_ends && other_starts_before_end
    }
}

/// A normalized set of key ranges: sorted, disjoint and non-adjacent.
///
/// Used to record what a transaction has read.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KeyRanges {
    ranges: Vec<KeyRange>,
}

impl KeyRanges {
    pub fn new() -> Self {
        KeyRanges::default()
    }

    pub fn add(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }
        self.ranges.push(range);
        self.ranges.sort_by(|a, b| a.start.cmp(&b.start));

        let mut merged: Vec<KeyRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end.as_ref().map_or(true, |end| r.start <= *end) => {
                    let end = match (last.end.take(), r.end) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        _ => None,
                    };
                    last.end = end;
                }
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.ranges.iter().any(|r| r.contains(key))
    }

    pub fn intersects(&self, range: &KeyRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps(range))
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl FromIterator<KeyRange> for KeyRanges {
    fn from_iter<I: IntoIterator<Item = KeyRange>>(iter: I) -> Self {
        let mut ranges = KeyRanges::new();
        for r in iter {
            ranges.add(r);
        }
        ranges
    }
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// A single write buffered by a transaction and replicated inside a log entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    DeleteRange { range: KeyRange },
}

impl Mutation {
    /// Keys this mutation may write.
    pub fn range(&self) -> KeyRange {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => KeyRange::single(key),
            Mutation::DeleteRange { range } => range.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster configuration
// ---------------------------------------------------------------------------

/// Voting members of the consensus group and their cluster addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterConfig {
    pub members: BTreeMap<NodeId, String>,
    /// Last known leader. Not replicated.
    #[serde(skip)]
    pub leader_hint: Option<NodeId>,
}

impl ClusterConfig {
    pub fn new(members: impl IntoIterator<Item = (NodeId, String)>) -> Self {
        ClusterConfig { members: members.into_iter().collect(), leader_hint: None }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn addr(&self, id: NodeId) -> Option<&str> {
        self.members.get(&id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Strict majority of the members.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Configuration that results from applying `change`.
    pub fn apply(&self, change: &ConfigChange) -> Result<ClusterConfig, RkvError> {
        let mut next = self.clone();
        match change {
            ConfigChange::AddMember { id, addr } => {
                if next.members.insert(*id, addr.clone()).is_some() {
                    return Err(RkvError::InvalidArgument(format!("node {id} is already a member")));
                }
            }
            ConfigChange::RemoveMember { id } => {
                if next.members.remove(id).is_none() {
                    return Err(RkvError::InvalidArgument(format!("node {id} is not a member")));
                }
                if next.members.is_empty() {
                    return Err(RkvError::InvalidArgument("cannot remove the last member".into()));
                }
            }
        }
        Ok(next)
    }
}

/// Single-server membership change.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConfigChange {
    AddMember { id: NodeId, addr: String },
    RemoveMember { id: NodeId },
}

// ---------------------------------------------------------------------------
// Commit protocol
// ---------------------------------------------------------------------------

/// What a transaction submits to the leader on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommitRequest {
    pub base_index: u64,
    /// Set when the snapshot included uncommitted entries: the term of the
    /// entry at `base_index` when the transaction began.
    pub base_term: Option<u64>,
    pub reads: KeyRanges,
    pub writes: Vec<Mutation>,
}

/// Where a committed transaction landed in the log. For read-only
/// transactions this is the index their reads were validated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommitResult {
    pub index: u64,
    pub term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StoreKind {
    Raft,
    Standalone,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Raft => f.write_str("raft"),
            StoreKind::Standalone => f.write_str("standalone"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Executing,
    Committing,
    Committed,
    Closed,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RkvError {
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<NodeId>, addr: Option<String> },
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("operation timed out")]
    Timeout,
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
    #[error("log inconsistency at index {index}: expected term {expected_term}, found {actual_term:?}")]
    LogInconsistency { index: u64, expected_term: u64, actual_term: Option<u64> },
    #[error("invalid transaction state: {0}")]
    InvalidState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("node is shutting down")]
    Shutdown,
}

impl RkvError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RkvError::Conflict(_))
    }

    /// Errors that say the distributed store could not serve the request.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RkvError::NotLeader { .. }
                | RkvError::Timeout
                | RkvError::Unreachable(_)
                | RkvError::Shutdown
        )
    }
}
