//! End-to-end shard node tests through the public library API.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_store::master::{CoordClient, MasterLock, MemCoordService};
use strata_store::node::{KvNode, ShardConfig};
use strata_store::{StoreError, Value};

fn config(dir: &Path) -> ShardConfig {
    ShardConfig::new(1, 1, dir, "default")
}

fn argv(parts: &[&[u8]]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.to_vec()).collect()
}

#[tokio::test]
async fn set_get_round_trip_advances_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let node = KvNode::open(config(dir.path())).unwrap();

    let before = node.stats().unwrap().last_index;
    let res = node
        .propose(argv(&[b"SET", b"default:foo", b"bar"]))
        .await
        .unwrap();
    assert_eq!(res, Value::Int(1));
    assert_eq!(
        node.get(b"default:foo").unwrap(),
        Some(b"bar".to_vec())
    );

    let stats = node.stats().unwrap();
    assert_eq!(stats.last_index, before + 1);
    assert_eq!(stats.applied_index, stats.last_index);

    node.shutdown().await;
}

#[tokio::test]
async fn setnx_contention_resolves_in_commit_order() {
    let dir = tempfile::tempdir().unwrap();
    let node = KvNode::open(config(dir.path())).unwrap();

    let first = node
        .propose(argv(&[b"SETNX", b"default:k", b"v1"]))
        .await
        .unwrap();
    let second = node
        .propose(argv(&[b"SETNX", b"default:k", b"v2"]))
        .await
        .unwrap();
    assert_eq!(first, Value::Int(1));
    assert_eq!(second, Value::Int(0));
    assert_eq!(node.get(b"default:k").unwrap(), Some(b"v1".to_vec()));

    node.shutdown().await;
}

#[tokio::test]
async fn incr_overflow_leaves_the_value_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let node = KvNode::open(config(dir.path())).unwrap();

    node.propose(argv(&[
        b"SET",
        b"default:n",
        i64::MAX.to_string().as_bytes(),
    ]))
    .await
    .unwrap();
    let err = node
        .propose(argv(&[b"INCR", b"default:n"]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Overflow));
    assert_eq!(
        node.get(b"default:n").unwrap(),
        Some(i64::MAX.to_string().into_bytes())
    );

    node.shutdown().await;
}

#[tokio::test]
async fn foreign_namespaces_are_rejected_before_proposing() {
    let dir = tempfile::tempdir().unwrap();
    let node = KvNode::open(config(dir.path())).unwrap();
    let before = node.stats().unwrap().last_index;

    let err = node
        .propose(argv(&[b"SET", b"other:k", b"v"]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::WrongNamespace));
    let err = node
        .propose(argv(&[b"SET", b"nocolon", b"v"]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidKey));
    let err = node.get(b"other:k").unwrap_err();
    assert!(matches!(err, StoreError::WrongNamespace));

    // Nothing reached the log.
    assert_eq!(node.stats().unwrap().last_index, before);

    node.shutdown().await;
}

#[tokio::test]
async fn argument_shapes_are_validated_before_proposing() {
    let dir = tempfile::tempdir().unwrap();
    let node = KvNode::open(config(dir.path())).unwrap();

    let cases: Vec<(Vec<Vec<u8>>, fn(&StoreError) -> bool)> = vec![
        (
            argv(&[b"SET", b"default:k", b"v", b"NX", b"XX"]),
            |e| matches!(e, StoreError::InvalidArgs),
        ),
        (
            argv(&[b"SET", b"default:k", b"v", b"EX", b"-1"]),
            |e| matches!(e, StoreError::InvalidTtl),
        ),
        (
            argv(&[b"PFCOUNT", b"default:a", b"default:b"]),
            |e| matches!(e, StoreError::InvalidArgs),
        ),
        (
            argv(&[b"SETBIT", b"default:k", b"99999999999", b"1"]),
            |e| matches!(e, StoreError::BitOverflow),
        ),
        (
            argv(&[b"SETBIT", b"default:k", b"0", b"2"]),
            |e| matches!(e, StoreError::InvalidArgs),
        ),
        (
            argv(&[b"SETRANGE", b"default:k", b"-1", b"x"]),
            |e| matches!(e, StoreError::InvalidArgs),
        ),
        (
            argv(&[b"FLUSHALL", b"default:k"]),
            |e| matches!(e, StoreError::InvalidArgs),
        ),
        (
            argv(&[b"MSET", b"default:a", b"1", b"default:b"]),
            |e| matches!(e, StoreError::InvalidArgs),
        ),
    ];

    for (cmd, check) in cases {
        let err = node.propose(cmd.clone()).await.unwrap_err();
        assert!(check(&err), "command {cmd:?} produced {err:?}");
    }

    node.shutdown().await;
}

#[tokio::test]
async fn expired_keys_disappear_from_local_reads() {
    let dir = tempfile::tempdir().unwrap();
    let node = KvNode::open(config(dir.path())).unwrap();

    node.propose(argv(&[b"SET", b"default:tmp", b"v", b"EX", b"1"]))
        .await
        .unwrap();
    assert_eq!(node.get(b"default:tmp").unwrap(), Some(b"v".to_vec()));
    assert_eq!(node.exists(&argv(&[b"default:tmp"])).unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(node.get(b"default:tmp").unwrap(), None);
    assert_eq!(node.exists(&argv(&[b"default:tmp"])).unwrap(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn reads_cover_mget_strlen_and_getbit() {
    let dir = tempfile::tempdir().unwrap();
    let node = KvNode::open(config(dir.path())).unwrap();

    node.propose(argv(&[b"MSET", b"default:a", b"alpha", b"default:b", b"beta"]))
        .await
        .unwrap();
    node.propose(argv(&[b"SETBIT", b"default:bits", b"1", b"1"]))
        .await
        .unwrap();

    let values = node
        .mget(&argv(&[b"default:a", b"default:missing", b"default:b"]))
        .unwrap();
    assert_eq!(
        values,
        vec![Some(b"alpha".to_vec()), None, Some(b"beta".to_vec())]
    );
    assert_eq!(node.str_len(b"default:a").unwrap(), 5);
    assert_eq!(node.get_bit(b"default:bits", 1).unwrap(), 1);
    assert_eq!(node.get_bit(b"default:bits", 2).unwrap(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn restart_recovers_applied_state_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    {
        let node = KvNode::open(config(dir.path())).unwrap();
        node.propose(argv(&[b"SET", b"default:k", b"v"])).await.unwrap();
        node.propose(argv(&[b"INCR", b"default:n"])).await.unwrap();
        node.propose(argv(&[b"INCR", b"default:n"])).await.unwrap();
        node.shutdown().await;
    }

    let node = KvNode::open(config(dir.path())).unwrap();
    assert_eq!(node.get(b"default:k").unwrap(), Some(b"v".to_vec()));
    // The counter continues from the recovered state.
    let res = node.propose(argv(&[b"INCR", b"default:n"])).await.unwrap();
    assert_eq!(res, Value::Int(3));

    let stats = node.stats().unwrap();
    assert_eq!(stats.applied_index, stats.last_index);

    node.shutdown().await;
}

#[tokio::test]
async fn snapshot_policy_checkpoints_and_compacts() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.snap_count = 4;
    let node = KvNode::open(cfg).unwrap();

    for i in 0..10u32 {
        node.propose(argv(&[
            b"SET",
            format!("default:k{i}").as_bytes(),
            b"v",
        ]))
        .await
        .unwrap();
    }

    let stats = node.stats().unwrap();
    assert!(stats.first_index > 1, "log was not compacted: {stats:?}");
    assert_eq!(stats.applied_index, 10);

    let checkpoints: Vec<_> = std::fs::read_dir(dir.path().join("checkpoints"))
        .unwrap()
        .collect();
    assert!(!checkpoints.is_empty());

    // Reads still work after compaction.
    assert_eq!(node.get(b"default:k0").unwrap(), Some(b"v".to_vec()));

    node.shutdown().await;
}

#[tokio::test]
async fn lease_events_gate_proposing() {
    let dir = tempfile::tempdir().unwrap();
    let node = KvNode::open(config(dir.path())).unwrap();

    let svc = Arc::new(MemCoordService::new());
    let client: Arc<dyn CoordClient> = svc.clone();
    let (lock, events) = MasterLock::new(client, "cluster/shard-1/master", "node-1", 5);
    node.attach_master(events);

    // Followers reject writes until the lease is held.
    let err = node
        .propose(argv(&[b"SET", b"default:k", b"v"]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotLeader));

    lock.start();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !node.is_leader() {
        assert!(Instant::now() < deadline, "never became leader");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    node.propose(argv(&[b"SET", b"default:k", b"v"]))
        .await
        .unwrap();

    // Another node stealing the lock demotes us.
    let (record, _) = svc.get("cluster/shard-1/master").await.unwrap();
    svc.compare_and_swap(
        "cluster/shard-1/master",
        "node-2",
        5,
        &record.value,
        record.modified_index,
    )
    .await
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while node.is_leader() {
        assert!(Instant::now() < deadline, "never demoted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let err = node
        .propose(argv(&[b"SET", b"default:k", b"v2"]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotLeader));

    let deadline = Instant::now() + Duration::from_secs(10);
    while node.current_master() != "node-2" {
        assert!(Instant::now() < deadline, "master hint never updated");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    lock.stop().await;
    node.shutdown().await;
}
