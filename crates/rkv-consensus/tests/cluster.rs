//! Multi-node behaviour of the consensus engine over the in-process network.

use std::collections::BTreeMap;
use std::time::Duration;

use rkv_consensus::testing::TestCluster;
use rkv_consensus::Role;
use rkv_types::{CommitRequest, ConfigChange, KeyRange, KeyRanges, Mutation, RkvError};

const WAIT: Duration = Duration::from_secs(5);

fn put(key: &str, value: &str) -> CommitRequest {
    CommitRequest {
        writes: vec![Mutation::Put { key: key.as_bytes().to_vec(), value: value.as_bytes().to_vec() }],
        ..CommitRequest::default()
    }
}

fn kv(key: &str, value: &str) -> (Vec<u8>, Vec<u8>) {
    (key.as_bytes().to_vec(), value.as_bytes().to_vec())
}

#[tokio::test]
async fn single_node_elects_itself_and_commits() {
    let cluster = TestCluster::start(1).await.unwrap();
    let leader = cluster.wait_for_leader(&[1], WAIT).await.unwrap();
    assert_eq!(leader, 1);

    let node = cluster.node(1).unwrap();
    let result = node.commit(put("a", "1")).await.unwrap();
    node.wait_applied(result.index, WAIT).await.unwrap();
    assert_eq!(cluster.contents(1).await.unwrap(), vec![kv("a", "1")]);
    assert!(node.read_index().await.unwrap() >= result.index);
}

#[tokio::test]
async fn at_most_one_leader_per_term() {
    let cluster = TestCluster::start(3).await.unwrap();
    let ids = cluster.ids();
    let mut leaders: BTreeMap<u64, u64> = BTreeMap::new();

    for _ in 0..3 {
        let leader = cluster.wait_for_leader(&ids, WAIT).await.unwrap();
        for _ in 0..20 {
            for id in &ids {
                let status = cluster.node(*id).unwrap().status();
                if status.role == Role::Leader {
                    let previous = leaders.insert(status.term, status.id);
                    assert!(previous.is_none() || previous == Some(status.id), "two leaders in term {}", status.term);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cluster.node(leader).unwrap().step_down().await.unwrap();
    }
    assert!(leaders.len() >= 2);
}

#[tokio::test]
async fn followers_converge_on_the_leader_log() {
    let cluster = TestCluster::start(3).await.unwrap();
    let ids = cluster.ids();
    let leader = cluster.node(cluster.wait_for_leader(&ids, WAIT).await.unwrap()).unwrap();

    let mut last = 0;
    for i in 0..20 {
        last = leader.commit(put(&format!("k{i:02}"), &i.to_string())).await.unwrap().index;
    }
    cluster.wait_applied(&ids, last, WAIT).await.unwrap();

    let expected = cluster.contents(leader.id()).await.unwrap();
    assert_eq!(expected.len(), 20);
    for id in &ids {
        assert_eq!(cluster.contents(*id).await.unwrap(), expected);
        assert_eq!(cluster.log_terms(*id, 1).await.unwrap(), cluster.log_terms(leader.id(), 1).await.unwrap());
    }
}

#[tokio::test]
async fn follower_forwards_commits_to_the_leader() {
    let cluster = TestCluster::start(3).await.unwrap();
    let ids = cluster.ids();
    let leader = cluster.wait_for_leader(&ids, WAIT).await.unwrap();
    let follower = cluster.node(*ids.iter().find(|id| **id != leader).unwrap()).unwrap();
    follower.wait_for(WAIT, |s| s.leader == Some(leader)).await.unwrap();

    let result = follower.commit(put("via", "follower")).await.unwrap();
    follower.wait_applied(result.index, WAIT).await.unwrap();
    assert_eq!(cluster.contents(follower.id()).await.unwrap(), vec![kv("via", "follower")]);
}

#[tokio::test]
async fn read_index_on_follower_covers_prior_commits() {
    let cluster = TestCluster::start(3).await.unwrap();
    let ids = cluster.ids();
    let leader = cluster.node(cluster.wait_for_leader(&ids, WAIT).await.unwrap()).unwrap();
    let follower = cluster.node(*ids.iter().find(|id| **id != leader.id()).unwrap()).unwrap();
    let leader_id = leader.id();
    follower.wait_for(WAIT, move |s| s.leader == Some(leader_id)).await.unwrap();

    let written = leader.commit(put("x", "1")).await.unwrap();
    let index = follower.read_index().await.unwrap();
    assert!(index >= written.index);
    follower.wait_applied(index, WAIT).await.unwrap();
    let sm = follower.store().read().await;
    assert_eq!(sm.get(b"x", index), Some(b"1".to_vec()));
}

#[tokio::test]
async fn commit_rejects_stale_reads() {
    let cluster = TestCluster::start(3).await.unwrap();
    let ids = cluster.ids();
    let leader = cluster.node(cluster.wait_for_leader(&ids, WAIT).await.unwrap()).unwrap();

    let base = leader.commit(put("x", "1")).await.unwrap().index;
    leader.commit(put("x", "2")).await.unwrap();

    let mut reads = KeyRanges::new();
    reads.add(KeyRange::single(b"x"));
    let stale = CommitRequest { base_index: base, reads: reads.clone(), ..put("y", "from x=1") };
    assert!(matches!(leader.commit(stale).await, Err(RkvError::Conflict(_))));

    // Reads of an untouched key at the same base still commit.
    let mut other = KeyRanges::new();
    other.add(KeyRange::single(b"z"));
    let fresh = CommitRequest { base_index: base, reads: other, ..put("y", "ok") };
    leader.commit(fresh).await.unwrap();

    // A read-only validation fails the same way.
    let validate = CommitRequest { base_index: base, reads, ..CommitRequest::default() };
    assert!(matches!(leader.commit(validate).await, Err(RkvError::Conflict(_))));
}

#[tokio::test]
async fn minority_partition_loses_leadership_and_catches_up() {
    let cluster = TestCluster::start(5).await.unwrap();
    let ids = cluster.ids();
    let old_leader = cluster.wait_for_leader(&ids, WAIT).await.unwrap();
    let old = cluster.node(old_leader).unwrap();
    let mut last = 0;
    for i in 0..10 {
        last = old.commit(put(&format!("k{i}"), "before")).await.unwrap().index;
    }
    cluster.wait_applied(&ids, last, WAIT).await.unwrap();
    let old_term = old.status().term;

    let minority: Vec<u64> = std::iter::once(old_leader)
        .chain(ids.iter().copied().filter(|id| *id != old_leader).take(1))
        .collect();
    let majority: Vec<u64> = ids.iter().copied().filter(|id| !minority.contains(id)).collect();
    cluster.network.partition(&minority);

    // The old leader appends but can never commit.
    let stranded = tokio::spawn({
        let old = old.clone();
        async move { old.commit(put("lost", "minority")).await }
    });

    let new_leader = cluster.node(cluster.wait_for_leader(&majority, WAIT).await.unwrap()).unwrap();
    assert!(new_leader.status().term > old_term);
    let committed = new_leader.commit(put("k0", "after")).await.unwrap();

    // Without a majority the old leader's lease runs out.
    old.wait_for(WAIT, |s| s.role != Role::Leader).await.unwrap();
    assert!(stranded.await.unwrap().is_err());

    cluster.network.heal();
    cluster.wait_applied(&ids, committed.index, WAIT).await.unwrap();
    let expected = cluster.contents(new_leader.id()).await.unwrap();
    assert!(expected.contains(&kv("k0", "after")));
    assert!(!expected.iter().any(|(k, _)| k == b"lost"));
    for id in &ids {
        assert_eq!(cluster.contents(*id).await.unwrap(), expected);
    }
    // The minority's uncommitted suffix was replaced.
    for id in &minority {
        assert_eq!(
            cluster.log_terms(*id, last + 1).await.unwrap()[..1],
            cluster.log_terms(new_leader.id(), last + 1).await.unwrap()[..1]
        );
    }
}

#[tokio::test]
async fn new_leader_keeps_committed_entries() {
    let cluster = TestCluster::start(3).await.unwrap();
    let ids = cluster.ids();
    let first = cluster.node(cluster.wait_for_leader(&ids, WAIT).await.unwrap()).unwrap();
    for i in 0..5 {
        first.commit(put(&format!("k{i}"), "v")).await.unwrap();
    }
    first.step_down().await.unwrap();

    let rest: Vec<u64> = ids.iter().copied().filter(|id| *id != first.id()).collect();
    let second = cluster.node(cluster.wait_for_leader(&rest, WAIT).await.unwrap()).unwrap();
    let index = second.read_index().await.unwrap();
    second.wait_applied(index, WAIT).await.unwrap();
    assert_eq!(cluster.contents(second.id()).await.unwrap().len(), 5);
}

#[tokio::test]
async fn isolated_leader_steps_down_and_rejects_reads() {
    let cluster = TestCluster::start(3).await.unwrap();
    let ids = cluster.ids();
    let leader = cluster.node(cluster.wait_for_leader(&ids, WAIT).await.unwrap()).unwrap();
    cluster.network.isolate(leader.id());

    leader.wait_for(WAIT, |s| s.role != Role::Leader).await.unwrap();
    assert!(leader.read_index().await.unwrap_err().is_unavailable());
}

#[tokio::test]
async fn leaderless_node_reports_unreachable() {
    let cluster = TestCluster::start(3).await.unwrap();
    let ids = cluster.ids();
    let leader = cluster.wait_for_leader(&ids, WAIT).await.unwrap();
    let lonely = cluster.node(*ids.iter().find(|id| **id != leader).unwrap()).unwrap();
    cluster.network.isolate(lonely.id());

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(matches!(lonely.commit(put("a", "1")).await, Err(RkvError::Unreachable(_))));
}

#[tokio::test]
async fn lagging_follower_catches_up_from_a_snapshot() {
    let mut cluster = TestCluster::start_with(3, |cfg| {
        cfg.snapshot_threshold = 8;
        cfg.history_retention = 4;
    })
    .await
    .unwrap();
    let ids = cluster.ids();
    let leader = cluster.node(cluster.wait_for_leader(&ids, WAIT).await.unwrap()).unwrap();
    let lagging = *ids.iter().find(|id| **id != leader.id()).unwrap();
    cluster.stop(lagging);

    let mut last = 0;
    for i in 0..30 {
        last = leader.commit(put(&format!("k{i:02}"), "v")).await.unwrap().index;
    }
    assert!(leader.status().snapshot_index > 0);

    let node = cluster.restart(lagging).await.unwrap();
    node.wait_applied(last, WAIT).await.unwrap();
    assert!(node.status().snapshot_index > 0);
    assert_eq!(cluster.contents(lagging).await.unwrap(), cluster.contents(leader.id()).await.unwrap());
}

#[tokio::test]
async fn restarted_cluster_recovers_committed_state() {
    let mut cluster = TestCluster::start_with(3, |cfg| cfg.snapshot_threshold = 5).await.unwrap();
    let ids = cluster.ids();
    let leader = cluster.node(cluster.wait_for_leader(&ids, WAIT).await.unwrap()).unwrap();
    let mut last = 0;
    for i in 0..12 {
        last = leader.commit(put(&format!("k{i:02}"), "v")).await.unwrap().index;
    }
    cluster.wait_applied(&ids, last, WAIT).await.unwrap();
    let expected = cluster.contents(leader.id()).await.unwrap();
    let term = leader.status().term;

    for id in &ids {
        cluster.restart(*id).await.unwrap();
    }
    let leader = cluster.node(cluster.wait_for_leader(&ids, WAIT).await.unwrap()).unwrap();
    assert!(leader.status().term > term);
    let index = leader.read_index().await.unwrap();
    cluster.wait_applied(&ids, index, WAIT).await.unwrap();
    for id in &ids {
        assert_eq!(cluster.contents(*id).await.unwrap(), expected);
    }
}

#[tokio::test]
async fn members_can_be_added_and_removed() {
    let mut cluster = TestCluster::start(3).await.unwrap();
    let ids = cluster.ids();
    let leader = cluster.node(cluster.wait_for_leader(&ids, WAIT).await.unwrap()).unwrap();
    leader.commit(put("a", "1")).await.unwrap();

    let joiner = cluster.add_node(4).await.unwrap();
    let added = leader
        .change_membership(ConfigChange::AddMember { id: 4, addr: TestCluster::addr(4) })
        .await
        .unwrap();
    joiner.wait_applied(added.index, WAIT).await.unwrap();
    assert!(joiner.status().config.contains(4));
    assert_eq!(cluster.contents(4).await.unwrap(), vec![kv("a", "1")]);

    let victim = *ids.iter().find(|id| **id != leader.id()).unwrap();
    let removed = leader.change_membership(ConfigChange::RemoveMember { id: victim }).await.unwrap();
    leader.wait_applied(removed.index, WAIT).await.unwrap();
    assert_eq!(leader.status().config.members.len(), 3);
    assert!(!leader.status().config.contains(victim));

    let after = leader.commit(put("b", "2")).await.unwrap();
    joiner.wait_applied(after.index, WAIT).await.unwrap();
}

#[tokio::test]
async fn removed_follower_learns_its_removal_and_stays_quiet() {
    let cluster = TestCluster::start(3).await.unwrap();
    let ids = cluster.ids();
    let leader = cluster.node(cluster.wait_for_leader(&ids, WAIT).await.unwrap()).unwrap();
    let victim_id = *ids.iter().find(|id| **id != leader.id()).unwrap();
    let victim = cluster.node(victim_id).unwrap();
    let remaining: Vec<_> = ids.iter().copied().filter(|id| *id != victim_id).collect();

    let removed = leader.change_membership(ConfigChange::RemoveMember { id: victim_id }).await.unwrap();
    cluster.wait_applied(&remaining, removed.index, WAIT).await.unwrap();
    victim.wait_for(WAIT, |s| !s.config.contains(victim_id)).await.unwrap();

    let term = leader.status().term;
    // Several election timeouts without a heartbeat for the removed node.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    for id in &remaining {
        let status = cluster.node(*id).unwrap().status();
        assert_eq!(status.term, term, "node {id} changed term");
        assert_eq!(status.leader, Some(leader.id()));
    }
    assert!(leader.is_leader());
    assert_ne!(victim.status().role, Role::Leader);

    let after = leader.commit(put("a", "1")).await.unwrap();
    cluster.wait_applied(&remaining, after.index, WAIT).await.unwrap();
}
