//! Switching between the replicated and the standalone store.

use std::time::{Duration, Instant};

use rkv_consensus::testing::TestCluster;
use rkv_txn::{
    FallbackConfig, FallbackKvDatabase, FallbackMode, KvDatabase, KvTransaction, LinearizablePolicy,
    RaftKvDatabase, ReconcilePolicy, StandaloneKvDatabase, TxOptions,
};
use rkv_types::{Consistency, RkvError, StoreKind, TxState};

const WAIT: Duration = Duration::from_secs(5);

fn config(reconcile: ReconcilePolicy, linearizable: LinearizablePolicy) -> FallbackConfig {
    FallbackConfig {
        check_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(150),
        min_unavailable: Duration::ZERO,
        min_available: Duration::ZERO,
        reconcile,
        standalone_linearizable: linearizable,
    }
}

async fn cluster_with_fallback(config: FallbackConfig) -> (TestCluster, FallbackKvDatabase) {
    let cluster = TestCluster::start(3).await.unwrap();
    cluster.wait_for_leader(&cluster.ids(), WAIT).await.unwrap();
    let node = cluster.node(1).unwrap();
    node.wait_for(WAIT, |s| s.leader.is_some()).await.unwrap();
    let db = FallbackKvDatabase::new(RaftKvDatabase::new(node), StandaloneKvDatabase::in_memory(), config);
    (cluster, db)
}

fn opts(consistency: Consistency) -> TxOptions {
    TxOptions::new(consistency)
}

async fn write(db: &FallbackKvDatabase, consistency: Consistency, key: &str, value: &str) -> StoreKind {
    let mut tx = db.begin(opts(consistency)).await.unwrap();
    tx.put(key, value).unwrap();
    tx.commit().await.unwrap();
    tx.kind()
}

async fn read(db: &FallbackKvDatabase, consistency: Consistency, key: &str) -> Option<Vec<u8>> {
    let mut tx = db.begin(opts(consistency)).await.unwrap();
    tx.get(key.as_bytes()).await.unwrap()
}

/// Probe until the coordinator settles in `mode`.
async fn settle(db: &FallbackKvDatabase, mode: FallbackMode) {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Ok(current) = db.check().await {
            if current == mode {
                return;
            }
        }
        assert!(Instant::now() < deadline, "never reached {mode}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn switches_to_standalone_and_discards_on_recovery() {
    let (cluster, db) = cluster_with_fallback(config(ReconcilePolicy::Discard, LinearizablePolicy::Reject)).await;
    assert_eq!(db.active_store(), StoreKind::Raft);
    assert_eq!(write(&db, Consistency::Linearizable, "a", "1").await, StoreKind::Raft);

    cluster.network.isolate(1);
    settle(&db, FallbackMode::Standalone).await;
    let state = db.state();
    assert_eq!(state.mode, FallbackMode::Standalone);
    assert!(state.last_switch.is_some());
    assert!(!state.migration_in_progress);

    // The standalone store starts from what this node had applied.
    assert_eq!(read(&db, Consistency::Eventual, "a").await, Some(b"1".to_vec()));
    assert_eq!(write(&db, Consistency::EventualCommitted, "b", "2").await, StoreKind::Standalone);
    let err = db.begin(opts(Consistency::Linearizable)).await.unwrap_err();
    assert!(matches!(err, RkvError::Unreachable(_)), "{err:?}");

    cluster.network.reconnect(1);
    settle(&db, FallbackMode::Normal).await;
    assert_eq!(db.active_store(), StoreKind::Raft);
    assert_eq!(read(&db, Consistency::Linearizable, "a").await, Some(b"1".to_vec()));
    assert_eq!(read(&db, Consistency::Linearizable, "b").await, None);
    assert!(db.standalone().is_empty().await);
}

#[tokio::test]
async fn resync_copies_standalone_writes_back() {
    let (cluster, db) = cluster_with_fallback(config(ReconcilePolicy::Discard, LinearizablePolicy::Reject)).await;
    write(&db, Consistency::Linearizable, "a", "1").await;
    write(&db, Consistency::Linearizable, "gone", "x").await;

    cluster.network.isolate(1);
    settle(&db, FallbackMode::Standalone).await;
    let mut tx = db.begin(opts(Consistency::Eventual)).await.unwrap();
    tx.put("b", "2").unwrap();
    tx.delete("gone").unwrap();
    tx.commit().await.unwrap();

    // Chosen while the outage is ongoing.
    db.set_reconcile_policy(ReconcilePolicy::Resync);
    assert_eq!(db.reconcile_policy(), ReconcilePolicy::Resync);

    cluster.network.reconnect(1);
    settle(&db, FallbackMode::Normal).await;
    assert_eq!(read(&db, Consistency::Linearizable, "a").await, Some(b"1".to_vec()));
    assert_eq!(read(&db, Consistency::Linearizable, "b").await, Some(b"2".to_vec()));
    assert_eq!(read(&db, Consistency::Linearizable, "gone").await, None);

    // Every replica converges on the resynced state.
    let index = db.raft().raft().status().commit_index;
    cluster.wait_applied(&cluster.ids(), index, WAIT).await.unwrap();
    for id in cluster.ids() {
        let contents = cluster.contents(id).await.unwrap();
        assert!(contents.contains(&(b"b".to_vec(), b"2".to_vec())), "node {id}: {contents:?}");
    }
}

#[tokio::test]
async fn in_flight_transactions_abort_across_a_switch() {
    let (cluster, db) = cluster_with_fallback(config(ReconcilePolicy::Discard, LinearizablePolicy::Reject)).await;
    let mut tx = db.begin(opts(Consistency::Linearizable)).await.unwrap();
    assert_eq!(tx.kind(), StoreKind::Raft);
    assert!(tx.as_raft().is_some());
    tx.put("k", "v").unwrap();

    cluster.network.isolate(1);
    settle(&db, FallbackMode::Standalone).await;

    // Never silently re-targeted at the standalone store.
    assert_eq!(tx.kind(), StoreKind::Raft);
    let err = tx.commit().await.unwrap_err();
    assert!(err.is_conflict(), "{err:?}");
    assert_eq!(tx.state(), TxState::Closed);
    assert_eq!(read(&db, Consistency::Eventual, "k").await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn begin_racing_a_switch_never_commits_to_the_old_store() {
    let (cluster, db) = cluster_with_fallback(config(ReconcilePolicy::Discard, LinearizablePolicy::Reject)).await;
    cluster.network.isolate(1);

    // A linearizable begin on the cut-off node waits on a read index while
    // the switch goes ahead without it.
    let racing = tokio::spawn({
        let db = db.clone();
        async move { db.begin(opts(Consistency::Linearizable)).await }
    });
    let started = Instant::now();
    settle(&db, FallbackMode::Standalone).await;
    assert!(started.elapsed() < Duration::from_secs(2), "switch waited {:?}", started.elapsed());

    match racing.await.unwrap() {
        Ok(mut tx) if tx.kind() == StoreKind::Raft => {
            tx.put("k", "v").unwrap();
            let err = tx.commit().await.unwrap_err();
            assert!(err.is_conflict(), "{err:?}");
        }
        Ok(tx) => panic!("linearizable transaction began on {}", tx.kind()),
        // Either the read index failed or the begin saw standalone mode.
        Err(err) => assert!(!err.is_conflict(), "{err:?}"),
    }
    assert_eq!(read(&db, Consistency::Eventual, "k").await, None);
}

#[tokio::test]
async fn linearizable_can_be_downgraded_in_standalone() {
    let (cluster, db) =
        cluster_with_fallback(config(ReconcilePolicy::Discard, LinearizablePolicy::Downgrade)).await;
    cluster.network.isolate(1);
    settle(&db, FallbackMode::Standalone).await;

    let mut tx = db.begin(opts(Consistency::Linearizable)).await.unwrap();
    assert_eq!(tx.kind(), StoreKind::Standalone);
    assert_eq!(tx.consistency(), Consistency::Linearizable);
    tx.put("k", "v").unwrap();
    tx.commit().await.unwrap();
    assert_eq!(db.standalone().export().await, vec![(b"k".to_vec(), b"v".to_vec())]);
}

#[tokio::test]
async fn short_outages_do_not_switch() {
    let mut cfg = config(ReconcilePolicy::Discard, LinearizablePolicy::Reject);
    cfg.min_unavailable = Duration::from_secs(60);
    let (cluster, db) = cluster_with_fallback(cfg).await;

    cluster.network.isolate(1);
    for _ in 0..3 {
        assert_eq!(db.check().await.unwrap(), FallbackMode::Normal);
    }
    assert_eq!(db.state().last_switch, None);
}

#[tokio::test]
async fn monitor_switches_within_a_probe_interval() {
    let (cluster, db) = cluster_with_fallback(config(ReconcilePolicy::Discard, LinearizablePolicy::Reject)).await;
    let monitor = db.spawn_monitor();

    cluster.network.isolate(1);
    let deadline = Instant::now() + WAIT;
    while db.active_store() != StoreKind::Standalone {
        assert!(Instant::now() < deadline, "monitor never switched");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(write(&db, Consistency::Eventual, "k", "v").await, StoreKind::Standalone);

    cluster.network.reconnect(1);
    let deadline = Instant::now() + WAIT;
    while db.active_store() != StoreKind::Raft {
        assert!(Instant::now() < deadline, "monitor never switched back");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    monitor.abort();
}

#[tokio::test]
async fn unreconciled_standalone_data_resumes_standalone_mode() {
    let cluster = TestCluster::start(1).await.unwrap();
    cluster.wait_for_leader(&[1], WAIT).await.unwrap();
    let standalone = StandaloneKvDatabase::in_memory();
    standalone.replace(vec![(b"k".to_vec(), b"v".to_vec())]).await.unwrap();

    let raft = RaftKvDatabase::new(cluster.node(1).unwrap());
    let db = FallbackKvDatabase::open(
        raft,
        standalone,
        config(ReconcilePolicy::Resync, LinearizablePolicy::Reject),
    )
    .await;
    assert_eq!(db.active_store(), StoreKind::Standalone);

    settle(&db, FallbackMode::Normal).await;
    assert_eq!(read(&db, Consistency::Linearizable, "k").await, Some(b"v".to_vec()));
}
