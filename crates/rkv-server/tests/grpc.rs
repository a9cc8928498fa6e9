//! A three-node cluster talking gRPC over loopback.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rkv_consensus::testing::fast_config;
use rkv_consensus::{start, RaftHandle};
use rkv_proto::v1::{
    self as pb, admin_service_client::AdminServiceClient, kv_service_client::KvServiceClient,
};
use rkv_server::{serve_client, serve_cluster, GrpcTransport};
use rkv_storage::MemLogStorage;
use rkv_txn::{FallbackConfig, FallbackKvDatabase, RaftKvDatabase, RetryPolicy, StandaloneKvDatabase};
use rkv_types::ClusterConfig;
use tokio::sync::watch;
use tonic::transport::Channel;
use tonic::Code;

const WAIT: Duration = Duration::from_secs(10);

struct Node {
    raft: RaftHandle,
    client_addr: SocketAddr,
    cluster_addr: SocketAddr,
}

struct Cluster {
    nodes: Vec<Node>,
    stop: watch::Sender<bool>,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        for node in &self.nodes {
            node.raft.shutdown();
        }
    }
}

async fn free_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn start_cluster(n: u64) -> Cluster {
    let mut addrs = Vec::new();
    for _ in 0..n {
        addrs.push((free_addr().await, free_addr().await));
    }
    let members = ClusterConfig::new((1..=n).map(|id| (id, addrs[id as usize - 1].1.to_string())));
    let (stop, stop_rx) = watch::channel(false);

    let mut nodes = Vec::new();
    for id in 1..=n {
        let (client_addr, cluster_addr) = addrs[id as usize - 1];
        let mut cfg = fast_config(id);
        cfg.rpc_timeout = Duration::from_millis(200);
        let transport = GrpcTransport::new(id, Duration::from_millis(200));
        let raft = start(cfg, members.clone(), MemLogStorage::new(), transport).await.unwrap();
        let db = FallbackKvDatabase::new(
            RaftKvDatabase::new(raft.clone()),
            StandaloneKvDatabase::in_memory(),
            FallbackConfig::default(),
        );
        let mut rx = stop_rx.clone();
        tokio::spawn(serve_client(client_addr, db.clone(), RetryPolicy::default(), async move {
            let _ = rx.wait_for(|s| *s).await;
        }));
        let mut rx = stop_rx.clone();
        tokio::spawn(serve_cluster(cluster_addr, raft.clone(), db, async move {
            let _ = rx.wait_for(|s| *s).await;
        }));
        nodes.push(Node { raft, client_addr, cluster_addr });
    }
    Cluster { nodes, stop }
}

async fn channel(addr: SocketAddr) -> Channel {
    let deadline = Instant::now() + WAIT;
    loop {
        match Channel::from_shared(format!("http://{addr}")).unwrap().connect().await {
            Ok(channel) => return channel,
            Err(e) => {
                assert!(Instant::now() < deadline, "cannot connect to {addr}: {e}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

async fn wait_for_leader(cluster: &Cluster) -> &Node {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(node) = cluster.nodes.iter().find(|n| n.raft.is_leader()) {
            let leader = node.raft.id();
            if cluster.nodes.iter().all(|n| n.raft.status().leader == Some(leader)) {
                return node;
            }
        }
        assert!(Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn put(key: &str, value: &str) -> pb::PutRequest {
    pb::PutRequest { key: key.into(), value: value.into(), options: None }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_serves_transactions_over_grpc() {
    let cluster = start_cluster(3).await;
    let leader = wait_for_leader(&cluster).await.raft.id();
    let follower = cluster.nodes.iter().find(|n| n.raft.id() != leader).unwrap();
    let mut kv = KvServiceClient::new(channel(follower.client_addr).await);

    let written = kv.put(put("a", "1")).await.unwrap().into_inner();
    let header = written.header.unwrap();
    assert_eq!(header.node_id, follower.raft.id());
    assert_eq!(header.store, pb::StoreKind::Raft as i32);
    assert!(written.index > 0);
    kv.put(put("b", "2")).await.unwrap();

    let got = kv
        .get(pb::GetRequest { key: b"a".to_vec(), options: None })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(got.value, Some(b"1".to_vec()));
    assert!(got.header.unwrap().base_index >= written.index);

    let scanned = kv
        .scan(pb::ScanRequest { range: None, limit: 0, options: None })
        .await
        .unwrap()
        .into_inner();
    let keys: Vec<_> = scanned.kvs.iter().map(|kv| kv.key.clone()).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

    let err = kv.put(put("", "x")).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn txn_applies_mutations_only_when_compares_hold() {
    let cluster = start_cluster(3).await;
    let leader = wait_for_leader(&cluster).await;
    let mut kv = KvServiceClient::new(channel(leader.client_addr).await);
    kv.put(put("x", "old")).await.unwrap();

    let swap = |expected: &str, new: &str| pb::TxnRequest {
        options: None,
        compares: vec![pb::Compare { key: b"x".to_vec(), value: Some(expected.into()) }],
        gets: vec![b"x".to_vec()],
        mutations: vec![pb::Mutation {
            op: Some(pb::mutation::Op::Put(pb::mutation::Put { key: b"x".to_vec(), value: new.into() })),
        }],
    };

    let failed = kv.txn(swap("other", "new")).await.unwrap().into_inner();
    assert!(!failed.succeeded);
    assert_eq!(failed.gets[0].value, Some(b"old".to_vec()));

    let swapped = kv.txn(swap("old", "new")).await.unwrap().into_inner();
    assert!(swapped.succeeded);
    let got = kv
        .get(pb::GetRequest { key: b"x".to_vec(), options: None })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(got.value, Some(b"new".to_vec()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admin_reports_status_and_sets_policy() {
    let cluster = start_cluster(3).await;
    let leader = wait_for_leader(&cluster).await;
    let mut admin = AdminServiceClient::new(channel(leader.cluster_addr).await);

    let status = admin.cluster_status(pb::ClusterStatusRequest {}).await.unwrap().into_inner();
    assert_eq!(status.role, pb::Role::Leader as i32);
    assert_eq!(status.leader_id, leader.raft.id());
    assert_eq!(status.members.len(), 3);

    let fallback = admin.fallback_status(pb::FallbackStatusRequest {}).await.unwrap().into_inner();
    assert_eq!(fallback.mode, pb::FallbackMode::Normal as i32);
    assert_eq!(fallback.reconcile, pb::ReconcilePolicy::Discard as i32);
    assert_eq!(fallback.last_switch_unix_ms, 0);

    let updated = admin
        .set_reconcile_policy(pb::SetReconcilePolicyRequest { policy: pb::ReconcilePolicy::Resync as i32 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(updated.reconcile, pb::ReconcilePolicy::Resync as i32);

    // Membership changes go to the leader; a follower names it.
    let follower = cluster.nodes.iter().find(|n| n.raft.id() != leader.raft.id()).unwrap();
    let mut follower_admin = AdminServiceClient::new(channel(follower.cluster_addr).await);
    let err = follower_admin
        .remove_member(pb::RemoveMemberRequest { id: 3 })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(
        err.metadata().get("rkv-leader-id").unwrap().to_str().unwrap(),
        leader.raft.id().to_string()
    );
}
