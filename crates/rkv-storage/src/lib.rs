pub mod fjall;
pub mod keys;
pub mod mem;
pub mod mvcc;
pub mod traits;
pub mod types;

pub use fjall::{FjallKvStore, FjallLogStorage, FjallStore};
pub use mem::MemLogStorage;
pub use mvcc::{MvccStore, SnapshotPin, SnapshotPins};
pub use traits::LogStorage;
pub use types::{HardState, LogEntry, LogPayload, LogState, Snapshot, SnapshotMeta};
