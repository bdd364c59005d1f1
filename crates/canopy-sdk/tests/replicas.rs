//! Replica handles used from async tasks.

use canopy_sdk::prelude::*;
use canopy_sdk::SdkError;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

fn replica(id: &str) -> Replica {
    Replica::new(ReplicaConfigBuilder::new().replica_id(id).build())
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_subscriber_sees_events_below_its_path() {
    let alice = replica("alice");
    alice.import_json(br#"{"name": "a", "items": []}"#).unwrap();
    let items = alice.node_at("/items").unwrap();

    let mut rx = alice.subscribe("/items").unwrap();
    let mut everything = alice.subscribe("/").unwrap();

    let first = alice.import_json_at(b"1", &items, "", None).unwrap();
    alice.set_value("/name", "b").unwrap();
    alice.delete(&first).unwrap();

    let added = rx.recv().await.unwrap();
    assert_eq!(added.kind, NodeEventKind::Added);
    assert_eq!(added.path, "/items/0");
    assert_eq!(added.node_id, first);

    let deleted = rx.recv().await.unwrap();
    assert_eq!(deleted.kind, NodeEventKind::MarkedDeleted);
    assert_eq!(deleted.path, "/items/0");
    assert!(rx.try_recv().is_err());

    let kinds: Vec<NodeEventKind> = (0..3)
        .map(|_| everything.try_recv().unwrap().kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            NodeEventKind::Added,
            NodeEventKind::Updated,
            NodeEventKind::MarkedDeleted
        ]
    );
}

#[tokio::test]
async fn test_slow_subscriber_does_not_block_writer() {
    let alice = Replica::new(
        ReplicaConfigBuilder::new()
            .replica_id("alice")
            .subscriber_capacity(2)
            .build(),
    );
    alice.import_json(br#"{"n": 0}"#).unwrap();
    let mut rx = alice.subscribe("/n").unwrap();

    for i in 1..=10i64 {
        alice.set_value("/n", i).unwrap();
    }
    assert_eq!(alice.get("/n").unwrap(), json!(10));

    let mut received = 0;
    while rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 2);
}

#[tokio::test]
async fn test_close_ends_subscriptions() {
    let alice = replica("alice");
    let mut rx = alice.subscribe("/").unwrap();
    let waiter = tokio::spawn(async move { rx.recv().await });

    alice.close();
    let outcome = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    assert!(outcome.is_none());
    assert!(matches!(alice.import_json(b"{}"), Err(SdkError::Closed(_))));
}

// ============================================================================
// Concurrent writers
// ============================================================================

#[tokio::test]
async fn test_writers_on_many_tasks_converge() {
    let alice = replica("alice");
    alice.import_json(br#"{"log": []}"#).unwrap();
    let replicas: Vec<Replica> = ["bob", "carol", "dave"].into_iter().map(replica).collect();
    for other in &replicas {
        other.sync_with(&alice).unwrap();
    }
    let log = alice.node_at("/log").unwrap();

    let mut handles = Vec::new();
    for (n, r) in replicas.iter().cloned().enumerate() {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..5 {
                let entry = json!(format!("{}-{}", n, i)).to_string();
                r.import_json_at(entry.as_bytes(), &log, "", None).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for other in &replicas {
        alice.sync_with(other).unwrap();
    }
    for other in &replicas {
        other.sync_with(&alice).unwrap();
    }

    let expected = alice.get("/").unwrap();
    assert_eq!(expected["log"].as_array().unwrap().len(), 15);
    for other in &replicas {
        assert_eq!(other.get("/").unwrap(), expected);
        assert_eq!(other.snapshot().save().unwrap(), alice.snapshot().save().unwrap());
    }
}

#[tokio::test]
async fn test_opposing_syncs_do_not_deadlock() {
    let alice = replica("alice");
    let bob = replica("bob");
    alice.import_json(br#"{"count": 0}"#).unwrap();
    bob.sync_with(&alice).unwrap();

    let (a1, b1) = (alice.clone(), bob.clone());
    let forward = tokio::task::spawn_blocking(move || {
        for i in 0..50i64 {
            a1.set_value("/count", i).unwrap();
            a1.sync_with(&b1).unwrap();
        }
    });
    let (a2, b2) = (alice.clone(), bob.clone());
    let backward = tokio::task::spawn_blocking(move || {
        for _ in 0..50 {
            b2.sync_with(&a2).unwrap();
        }
    });

    timeout(Duration::from_secs(30), async {
        forward.await.unwrap();
        backward.await.unwrap();
    })
    .await
    .unwrap();

    alice.sync_with(&bob).unwrap();
    assert_eq!(alice.get("/count").unwrap(), json!(49));
    assert_eq!(bob.get("/count").unwrap(), json!(49));
}
