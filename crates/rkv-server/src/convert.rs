use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rkv_consensus::Role;
use rkv_proto::v1 as pb;
use rkv_txn::{FallbackMode, ReconcilePolicy, TxOptions};
use rkv_types::{ClusterConfig, Consistency, KeyRange, Mutation, NodeId, RkvError, StoreKind};
use tonic::metadata::MetadataValue;
use tonic::{Code, Status};

pub const LEADER_ID_HEADER: &str = "rkv-leader-id";
pub const LEADER_ADDR_HEADER: &str = "rkv-leader-addr";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub fn rkv_to_status(err: RkvError) -> Status {
    match &err {
        RkvError::NotLeader { leader, addr } => {
            let mut status = Status::unavailable(err.to_string());
            if let Some(id) = leader {
                status.metadata_mut().insert(LEADER_ID_HEADER, MetadataValue::from(*id));
            }
            if let Some(addr) = addr {
                if let Ok(val) = MetadataValue::try_from(addr.as_str()) {
                    status.metadata_mut().insert(LEADER_ADDR_HEADER, val);
                }
            }
            status
        }
        RkvError::Conflict(_) => Status::aborted(err.to_string()),
        RkvError::Timeout => Status::deadline_exceeded(err.to_string()),
        RkvError::Unreachable(_) | RkvError::Shutdown => Status::unavailable(err.to_string()),
        RkvError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        RkvError::InvalidState(_) => Status::failed_precondition(err.to_string()),
        RkvError::LogInconsistency { .. } | RkvError::Storage(_) | RkvError::Consensus(_) => {
            Status::internal(err.to_string())
        }
    }
}

/// Failure of a call to another node, before any reply arrived.
pub fn status_to_rkv(status: Status) -> RkvError {
    match status.code() {
        Code::DeadlineExceeded => RkvError::Timeout,
        Code::Unavailable | Code::Cancelled | Code::Unknown => {
            RkvError::Unreachable(status.message().to_string())
        }
        Code::InvalidArgument => RkvError::InvalidArgument(status.message().to_string()),
        _ => RkvError::Consensus(format!("{:?}: {}", status.code(), status.message())),
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub fn consistency_from_proto(raw: i32) -> Result<Consistency, Status> {
    let parsed = pb::Consistency::try_from(raw)
        .map_err(|_| Status::invalid_argument(format!("unknown consistency {raw}")))?;
    Ok(match parsed {
        pb::Consistency::Linearizable => Consistency::Linearizable,
        pb::Consistency::EventualCommitted => Consistency::EventualCommitted,
        pb::Consistency::Eventual => Consistency::Eventual,
        pb::Consistency::Uncommitted => Consistency::Uncommitted,
    })
}

pub fn tx_options(options: Option<pb::TxnOptions>) -> Result<TxOptions, Status> {
    let options = options.unwrap_or_default();
    let mut parsed = TxOptions::new(consistency_from_proto(options.consistency)?);
    if options.timeout_ms > 0 {
        parsed = parsed.with_timeout(Duration::from_millis(options.timeout_ms));
    }
    Ok(parsed)
}

pub fn key_range_from_proto(range: Option<pb::KeyRange>) -> KeyRange {
    match range {
        Some(r) => KeyRange::new(r.start, r.end),
        None => KeyRange::all(),
    }
}

pub fn mutation_from_proto(mutation: pb::Mutation) -> Result<Mutation, Status> {
    use pb::mutation::Op;
    match mutation.op {
        Some(Op::Put(put)) => Ok(Mutation::Put { key: non_empty(put.key)?, value: put.value }),
        Some(Op::Delete(delete)) => Ok(Mutation::Delete { key: non_empty(delete.key)? }),
        Some(Op::DeleteRange(range)) => Ok(Mutation::DeleteRange { range: key_range_from_proto(Some(range)) }),
        None => Err(Status::invalid_argument("mutation has no operation")),
    }
}

pub fn non_empty(key: Vec<u8>) -> Result<Vec<u8>, Status> {
    if key.is_empty() {
        return Err(Status::invalid_argument("key must not be empty"));
    }
    Ok(key)
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn store_kind_to_proto(kind: StoreKind) -> pb::StoreKind {
    match kind {
        StoreKind::Raft => pb::StoreKind::Raft,
        StoreKind::Standalone => pb::StoreKind::Standalone,
    }
}

pub fn role_to_proto(role: Role) -> pb::Role {
    match role {
        Role::Follower => pb::Role::Follower,
        Role::Candidate => pb::Role::Candidate,
        Role::Leader => pb::Role::Leader,
    }
}

pub fn members_to_proto(config: &ClusterConfig) -> Vec<pb::Member> {
    config
        .members
        .iter()
        .map(|(id, addr)| pb::Member { id: *id, addr: addr.clone() })
        .collect()
}

pub fn member_from_proto(member: Option<pb::Member>) -> Result<(NodeId, String), Status> {
    let member = member.ok_or_else(|| Status::invalid_argument("member is required"))?;
    if member.id == 0 {
        return Err(Status::invalid_argument("member id must be non-zero"));
    }
    if member.addr.is_empty() {
        return Err(Status::invalid_argument("member addr must not be empty"));
    }
    Ok((member.id, member.addr))
}

pub fn fallback_mode_to_proto(mode: FallbackMode) -> pb::FallbackMode {
    match mode {
        FallbackMode::Normal => pb::FallbackMode::Normal,
        FallbackMode::Standalone => pb::FallbackMode::Standalone,
    }
}

pub fn reconcile_to_proto(policy: ReconcilePolicy) -> pb::ReconcilePolicy {
    match policy {
        ReconcilePolicy::Discard => pb::ReconcilePolicy::Discard,
        ReconcilePolicy::Resync => pb::ReconcilePolicy::Resync,
    }
}

pub fn reconcile_from_proto(raw: i32) -> Result<ReconcilePolicy, Status> {
    match pb::ReconcilePolicy::try_from(raw) {
        Ok(pb::ReconcilePolicy::Discard) => Ok(ReconcilePolicy::Discard),
        Ok(pb::ReconcilePolicy::Resync) => Ok(ReconcilePolicy::Resync),
        Err(_) => Err(Status::invalid_argument(format!("unknown reconcile policy {raw}"))),
    }
}

pub fn unix_millis(at: Option<SystemTime>) -> u64 {
    at.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_carries_the_leader_hint() {
        let status = rkv_to_status(RkvError::NotLeader { leader: Some(3), addr: Some("10.0.0.3:7001".into()) });
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.metadata().get(LEADER_ID_HEADER).unwrap().to_str().unwrap(), "3");
        assert_eq!(status.metadata().get(LEADER_ADDR_HEADER).unwrap().to_str().unwrap(), "10.0.0.3:7001");

        let status = rkv_to_status(RkvError::NotLeader { leader: None, addr: None });
        assert!(status.metadata().get(LEADER_ID_HEADER).is_none());
    }

    #[test]
    fn transaction_errors_map_to_distinct_codes() {
        assert_eq!(rkv_to_status(RkvError::Conflict("x".into())).code(), Code::Aborted);
        assert_eq!(rkv_to_status(RkvError::Timeout).code(), Code::DeadlineExceeded);
        assert_eq!(rkv_to_status(RkvError::Unreachable("x".into())).code(), Code::Unavailable);
        assert_eq!(rkv_to_status(RkvError::InvalidArgument("x".into())).code(), Code::InvalidArgument);
        assert_eq!(rkv_to_status(RkvError::Storage("disk".into())).code(), Code::Internal);
    }

    #[test]
    fn transport_failures_become_unreachable() {
        assert!(matches!(status_to_rkv(Status::unavailable("refused")), RkvError::Unreachable(_)));
        assert_eq!(status_to_rkv(Status::deadline_exceeded("slow")), RkvError::Timeout);
        assert!(matches!(status_to_rkv(Status::internal("boom")), RkvError::Consensus(_)));
    }

    #[test]
    fn options_default_to_linearizable_without_timeout() {
        let parsed = tx_options(None).unwrap();
        assert_eq!(parsed, TxOptions::new(Consistency::Linearizable));

        let parsed = tx_options(Some(pb::TxnOptions {
            consistency: pb::Consistency::Eventual as i32,
            timeout_ms: 250,
        }))
        .unwrap();
        assert_eq!(parsed.consistency, Consistency::Eventual);
        assert_eq!(parsed.timeout, Some(Duration::from_millis(250)));
        assert!(tx_options(Some(pb::TxnOptions { consistency: 42, timeout_ms: 0 })).is_err());
    }

    #[test]
    fn mutations_require_keys() {
        let put = pb::Mutation {
            op: Some(pb::mutation::Op::Put(pb::mutation::Put { key: Vec::new(), value: b"v".to_vec() })),
        };
        assert_eq!(mutation_from_proto(put).unwrap_err().code(), Code::InvalidArgument);
        assert!(mutation_from_proto(pb::Mutation { op: None }).is_err());

        let range = pb::Mutation {
            op: Some(pb::mutation::Op::DeleteRange(pb::KeyRange { start: b"a".to_vec(), end: None })),
        };
        assert_eq!(
            mutation_from_proto(range).unwrap(),
            Mutation::DeleteRange { range: KeyRange::new(b"a".to_vec(), None) }
        );
    }
}
