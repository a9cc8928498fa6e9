use std::time::Duration;

use rand::Rng;

use rkv_types::{NodeId, RkvError};

/// Timing and sizing knobs of one consensus node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: NodeId,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Deadline for a single peer RPC.
    pub rpc_timeout: Duration,
    /// A leader that has not heard from a majority for this long steps down.
    pub lease_timeout: Duration,
    /// Deadline for a commit or read-index request, including forwarding.
    pub commit_timeout: Duration,
    pub max_append_entries: usize,
    /// Applied entries beyond the last snapshot that trigger a new one.
    pub snapshot_threshold: u64,
    pub snapshot_chunk_bytes: usize,
    /// Applied versions kept below the applied index for conflict checks.
    pub history_retention: u64,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Attempts for idempotent forwarded requests (read-index).
    pub forward_attempts: u32,
}

impl RaftConfig {
    pub fn new(node_id: NodeId) -> Self {
        RaftConfig {
            node_id,
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            rpc_timeout: Duration::from_millis(200),
            lease_timeout: Duration::from_millis(300),
            commit_timeout: Duration::from_secs(5),
            max_append_entries: 256,
            snapshot_threshold: 10_000,
            snapshot_chunk_bytes: 1 << 20,
            history_retention: 1024,
            backoff_initial: Duration::from_millis(20),
            backoff_max: Duration::from_secs(1),
            forward_attempts: 3,
        }
    }

    pub fn validate(&self) -> Result<(), RkvError> {
        let invalid = |msg: &str| Err(RkvError::InvalidArgument(msg.to_string()));
        if self.heartbeat_interval.is_zero() {
            return invalid("heartbeat_interval must be positive");
        }
        if self.election_timeout_min <= self.heartbeat_interval {
            return invalid("election_timeout_min must exceed heartbeat_interval");
        }
        if self.election_timeout_max < self.election_timeout_min {
            return invalid("election_timeout_max must not be below election_timeout_min");
        }
        if self.lease_timeout < self.heartbeat_interval {
            return invalid("lease_timeout must be at least heartbeat_interval");
        }
        if self.snapshot_chunk_bytes == 0 || self.max_append_entries == 0 {
            return invalid("snapshot_chunk_bytes and max_append_entries must be positive");
        }
        if self.snapshot_threshold == 0 {
            return invalid("snapshot_threshold must be positive");
        }
        Ok(())
    }

    pub(crate) fn tick_interval(&self) -> Duration {
        (self.heartbeat_interval / 4).max(Duration::from_millis(1))
    }

    pub(crate) fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Horizon advance that triggers an MVCC compaction pass.
    pub(crate) fn compaction_step(&self) -> u64 {
        (self.history_retention / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RaftConfig::new(1).validate().unwrap();
    }

    #[test]
    fn rejects_inverted_election_window() {
        let mut cfg = RaftConfig::new(1);
        cfg.election_timeout_max = Duration::from_millis(100);
        assert!(cfg.validate().is_err());

        let mut cfg = RaftConfig::new(1);
        cfg.election_timeout_min = cfg.heartbeat_interval;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn election_timeout_stays_in_window() {
        let cfg = RaftConfig::new(1);
        for _ in 0..100 {
            let t = cfg.random_election_timeout();
            assert!(t >= cfg.election_timeout_min && t <= cfg.election_timeout_max);
        }
    }
}
