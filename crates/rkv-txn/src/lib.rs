//! Transactions over the replicated store, a standalone local store, and the
//! fallback coordinator that switches between them.
//!
//! Every store implements [`KvDatabase`]; its transactions implement
//! [`KvTransaction`] and report which backing store they run against through
//! [`KvTransaction::kind`].

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rkv_types::{
    CommitResult, Consistency, KeyRange, Mutation, RkvError, StoreKind, TxState, OPTION_CONSISTENCY,
    OPTION_TIMEOUT_MS,
};

pub mod buffer;
pub mod fallback;
pub mod raft;
pub mod retry;
pub mod standalone;

pub use fallback::{
    FallbackConfig, FallbackKvDatabase, FallbackMode, FallbackState, FallbackTransaction,
    LinearizablePolicy, ReconcilePolicy,
};
pub use raft::{RaftKvDatabase, RaftTransaction};
pub use retry::RetryPolicy;
pub use standalone::{StandaloneKvDatabase, StandaloneTransaction};

/// Per-transaction settings chosen at begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub consistency: Consistency,
    /// Upper bound on the whole transaction, commit included. `None` uses
    /// the store's commit timeout.
    pub timeout: Option<Duration>,
}

impl TxOptions {
    pub fn new(consistency: Consistency) -> Self {
        TxOptions { consistency, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Parse the string options of the external key-value interface.
    /// Unknown keys are ignored.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, RkvError> {
        let mut parsed = TxOptions::default();
        if let Some(value) = options.get(OPTION_CONSISTENCY) {
            parsed.consistency = value.parse()?;
        }
        if let Some(value) = options.get(OPTION_TIMEOUT_MS) {
            let ms: u64 = value.trim().parse().map_err(|_| {
                RkvError::InvalidArgument(format!("{OPTION_TIMEOUT_MS} must be an integer, got {value:?}"))
            })?;
            parsed.timeout = Some(Duration::from_millis(ms));
        }
        Ok(parsed)
    }
}

/// One transaction. Owned by a single caller; reads record the key ranges
/// they observed and writes are buffered until [`commit`](Self::commit).
pub trait KvTransaction: Send {
    fn kind(&self) -> StoreKind;

    fn consistency(&self) -> Consistency;

    fn state(&self) -> TxState;

    /// The log index (or standalone commit version) the reads observe.
    fn base_index(&self) -> u64;

    fn get(&mut self, key: &[u8]) -> impl Future<Output = Result<Option<Vec<u8>>, RkvError>> + Send;

    /// Live pairs in `range` in key order, at most `limit`.
    fn scan(
        &mut self,
        range: KeyRange,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<(Vec<u8>, Vec<u8>)>, RkvError>> + Send;

    fn write(&mut self, mutation: Mutation) -> Result<(), RkvError>;

    fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<(), RkvError> {
        self.write(Mutation::Put { key: key.into(), value: value.into() })
    }

    fn delete(&mut self, key: impl Into<Vec<u8>>) -> Result<(), RkvError> {
        self.write(Mutation::Delete { key: key.into() })
    }

    fn delete_range(&mut self, range: KeyRange) -> Result<(), RkvError> {
        self.write(Mutation::DeleteRange { range })
    }

    /// Submit the buffered writes. Resolves once they are durable, or with
    /// `Conflict` if a write committed since the base index touched the
    /// read set.
    fn commit(&mut self) -> impl Future<Output = Result<CommitResult, RkvError>> + Send;

    /// Discard the transaction. Never has a durable effect.
    fn rollback(&mut self);
}

pub trait KvDatabase: Send + Sync + 'static {
    type Tx: KvTransaction;

    fn kind(&self) -> StoreKind;

    fn begin(&self, options: TxOptions) -> impl Future<Output = Result<Self::Tx, RkvError>> + Send;
}
