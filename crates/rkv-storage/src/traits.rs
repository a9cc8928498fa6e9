use std::future::Future;

use rkv_types::RkvError;

use crate::types::{HardState, LogEntry, LogState, Snapshot};

/// Durable Raft log, hard state and snapshot boundary of one node.
///
/// Methods use RPITIT (`-> impl Future + Send`), so no `async-trait`
/// dependency is needed. Every mutating method is durable (fsync) before its
/// future resolves; on restart the node rebuilds its term, vote and log tail
/// from this store alone.
pub trait LogStorage: Send + Sync + 'static {
    /// Snapshot boundary and last entry of the log.
    fn log_state(&self) -> impl Future<Output = Result<LogState, RkvError>> + Send;

    /// The entry at `index`, or `None` if compacted or not yet written.
    fn entry(&self, index: u64) -> impl Future<Output = Result<Option<LogEntry>, RkvError>> + Send;

    /// All entries in the inclusive range `[from, to_inclusive]` that exist.
    fn read_range(
        &self,
        from: u64,
        to_inclusive: u64,
    ) -> impl Future<Output = Result<Vec<LogEntry>, RkvError>> + Send;

    /// Append `entries` after the local tail and return the new last index.
    ///
    /// Fails with [`RkvError::LogInconsistency`] if `(prev_index, prev_term)`
    /// is not the current tail. Entries must be contiguous from
    /// `prev_index + 1`.
    fn append(
        &self,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
    ) -> impl Future<Output = Result<u64, RkvError>> + Send;

    /// Delete all entries with `index >= from_index`. `from_index` must lie
    /// after the snapshot boundary.
    fn truncate_suffix(&self, from_index: u64) -> impl Future<Output = Result<(), RkvError>> + Send;

    /// Atomically store `snapshot` and drop the log prefix it covers. The
    /// suffix after the snapshot survives only if the entry at the snapshot
    /// index has the snapshot's term.
    fn install_snapshot(&self, snapshot: Snapshot) -> impl Future<Output = Result<(), RkvError>> + Send;

    /// The most recently installed snapshot.
    fn load_snapshot(&self) -> impl Future<Output = Result<Option<Snapshot>, RkvError>> + Send;

    fn save_hard_state(&self, state: HardState) -> impl Future<Output = Result<(), RkvError>> + Send;

    /// The last persisted hard state, or the default for a fresh node.
    fn read_hard_state(&self) -> impl Future<Output = Result<HardState, RkvError>> + Send;
}
