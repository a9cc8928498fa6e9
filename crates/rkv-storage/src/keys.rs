use rkv_types::RkvError;

/// `raft_log` keyspace: `index(8)`, big-endian so lexicographic order equals
/// numeric order.
pub fn raft_log_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Inverse of [`raft_log_key`].
pub fn raft_log_index(key: &[u8]) -> Result<u64, RkvError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| RkvError::Storage(format!("raft_log key has {} bytes, want 8", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

/// `meta` keyspace labels.
pub const META_HARD_STATE: &[u8] = b"hard_state";
pub const META_SNAPSHOT: &[u8] = b"snapshot_meta";
pub const META_STANDALONE_VERSION: &[u8] = b"standalone_version";

/// `snapshot` keyspace holds a single image under this key.
pub const SNAPSHOT_IMAGE: &[u8] = b"image";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raft_log_keys_sort_by_index() {
        let a = raft_log_key(1);
        let b = raft_log_key(2);
        let c = raft_log_key(1000);
        let d = raft_log_key(u64::MAX);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn raft_log_key_round_trips() {
        assert_eq!(raft_log_index(&raft_log_key(42)).unwrap(), 42);
        assert!(raft_log_index(b"short").is_err());
    }
}
