// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the replicator handles failures gracefully without
//! panics, deadlocks, stuck session slots, or corrupted counters.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use livesync_replicator::model::{EntryDoc, MILESTONE_DOCID, NODEINFO_DOCID, VERSIONING_DOCID};
use livesync_replicator::store::{Database, SyncMode};
use livesync_replicator::stream::{mailbox, ChangeBatch, Direction, ReplicationEvent};
use livesync_replicator::{ReplicationError, SyncStatus};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;

// =============================================================================
// Corrupted Remote Documents
// =============================================================================

/// Test: A malformed milestone fails the check instead of panicking
#[tokio::test]
async fn corrupted_milestone_no_panic() {
    init_tracing();
    let (replicator, env) = replicator();
    env.remote()
        .seed(json!({"_id": MILESTONE_DOCID, "created": "yesterday", "accepted_nodes": 42}))
        .await;

    let err = replicator.open_replication(&settings(), false, false, false).await.unwrap_err();
    assert!(matches!(err, ReplicationError::Store { .. }));
    assert!(!replicator.is_session_active());
    assert!(env.local().requests().is_empty());
}

/// Test: Unreadable version documents are treated as incompatible
#[tokio::test]
async fn corrupted_version_doc_is_incompatible() {
    let payloads = [
        json!({"_id": VERSIONING_DOCID, "type": "somethingelse", "version": 10}),
        json!({"_id": VERSIONING_DOCID, "type": "versioninfo", "version": "ten"}),
        json!({"_id": VERSIONING_DOCID}),
    ];
    for payload in payloads {
        let (replicator, env) = replicator();
        env.remote().seed(payload).await;
        let err = replicator
            .check_replication_connectivity(&settings(), false, false, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Incompatible(_)));
    }
}

/// Test: An unreadable node info is replaced rather than blocking startup
#[tokio::test]
async fn unreadable_node_info_regenerates_id() {
    let (replicator, env) = replicator();
    env.local()
        .store()
        .seed(json!({"_id": NODEINFO_DOCID, "type": "nodeinfo", "nodeid": 42}))
        .await;

    let node_id = replicator.node_id().await.unwrap();
    assert!(!node_id.is_empty());
    let stored = env.local().store().doc(NODEINFO_DOCID).await.unwrap();
    assert_eq!(stored["nodeid"], json!(node_id));
}

/// Test: A failed read of the node info keeps the persisted id
#[tokio::test]
async fn node_info_read_failure_keeps_id() {
    let (replicator, env) = replicator();
    env.local()
        .store()
        .seed(json!({"_id": NODEINFO_DOCID, "type": "nodeinfo", "nodeid": "kept-node"}))
        .await;
    env.local().store().inject_get_failures(1);

    let err = replicator.node_id().await.unwrap_err();
    assert!(matches!(err, ReplicationError::Store { .. }));
    let stored = env.local().store().doc(NODEINFO_DOCID).await.unwrap();
    assert_eq!(stored["nodeid"], "kept-node");

    assert_eq!(replicator.node_id().await.unwrap(), "kept-node");
}

/// Test: A replicated entry with an absurd size reconstructs without panicking
#[test]
fn corrupted_entry_size_no_panic() {
    let doc = json!({
        "_id": "note.md",
        "type": "plain",
        "path": "note.md",
        "children": ["h:1"],
        "ctime": 0,
        "mtime": 0,
        "size": u64::MAX
    });
    let Some(EntryDoc::Plain(entry)) = EntryDoc::from_document(&doc) else {
        panic!("entry should parse");
    };
    let leaves = HashMap::from([("h:1".to_string(), "content".to_string())]);
    assert_eq!(entry.reconstruct(&leaves).as_deref(), Some("content"));
}

// =============================================================================
// Store Failures
// =============================================================================

/// Test: Remote read failures surface as retryable errors and free the slot
#[tokio::test]
async fn remote_read_failure_frees_session() {
    let (replicator, env) = replicator();
    env.remote().inject_get_failures(1);

    let err = replicator.open_replication(&settings(), false, false, false).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!replicator.is_session_active());

    // The next attempt goes through
    assert!(replicator.open_replication(&settings(), false, false, false).await.unwrap());
}

/// Test: Connectivity flapping never leaves the replicator wedged
#[tokio::test]
async fn connectivity_flapping() {
    init_tracing();
    let (replicator, env) = replicator();
    let mut completed = 0;
    let mut failed = 0;

    for round in 0..10 {
        env.set_unreachable(round % 3 == 1);
        env.push_script(Script::completing(vec![pulled(1, round + 1)]));
        match replicator
            .open_one_shot_replication(&settings(), false, false, SyncMode::Sync, false)
            .await
        {
            Ok(true) => completed += 1,
            Ok(false) => panic!("round {round} cancelled unexpectedly"),
            Err(ReplicationError::Connection { .. }) => failed += 1,
            Err(other) => panic!("round {round}: unexpected error {other:?}"),
        }
        assert!(!replicator.is_session_active());
    }

    assert_eq!(failed, 3);
    assert_eq!(completed, 7);
    // Scripts queued during failed rounds are consumed later, one per session
    assert_eq!(replicator.stat().arrived, 7);
    assert_eq!(env.local().requests().len(), 7);
}

/// Test: Partial bulk failure keeps the progress of the other batches
#[tokio::test]
async fn partial_bulk_failure() {
    init_tracing();
    let (replicator, env) = replicator();
    replicator.open_replication(&settings(), false, false, false).await.unwrap();

    // 450 chunks go out as three batches of at most 200
    for i in 0..450 {
        env.local().store().seed(leaf(&format!("h:{i:04}"), "data")).await;
    }
    env.remote().inject_bulk_failures(1);

    assert!(!replicator.send_chunks(&settings(), None, false, None).await.unwrap());
    let uploaded = env.remote().len().await;
    assert!(uploaded >= 250, "two batches should have landed, got {uploaded}");
    assert_eq!(env.remote().bulk_calls().len(), 3);

    // Only the failed batch is retried
    assert!(replicator.send_chunks(&settings(), None, false, None).await.unwrap());
    let calls = env.remote().bulk_calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[3].len() <= 200);
    for i in 0..450 {
        assert!(env.remote().contains(&format!("h:{i:04}")).await);
    }
}

// =============================================================================
// Event Stream Under Load
// =============================================================================

/// Test: Concurrent producers keep their own order through the mailbox
#[tokio::test]
async fn concurrent_posts_keep_per_producer_order() {
    let (sink, mut rx) = mailbox();
    let mut producers = Vec::new();
    for producer in 0..4u64 {
        let sink = sink.clone();
        producers.push(tokio::spawn(async move {
            for seq in 0..250u64 {
                let event = ReplicationEvent::Change(ChangeBatch {
                    direction: Some(Direction::Pull),
                    docs: vec![json!({"producer": producer})],
                    last_seq: json!(seq),
                });
                assert!(sink.post(event).await);
            }
        }));
    }
    drop(sink);
    for producer in producers {
        producer.await.unwrap();
    }

    let mut last: HashMap<u64, u64> = HashMap::new();
    let mut total = 0;
    while let Some(event) = rx.recv().await {
        let ReplicationEvent::Change(batch) = event else {
            panic!("unexpected event");
        };
        let producer = batch.docs[0]["producer"].as_u64().unwrap();
        let seq = batch.last_seq.as_u64().unwrap();
        if let Some(previous) = last.insert(producer, seq) {
            assert!(seq > previous, "producer {producer} reordered: {previous} then {seq}");
        }
        total += 1;
    }
    assert_eq!(total, 1000);
}

/// Test: Closing during an event flood ends the session promptly
#[tokio::test]
async fn close_during_event_flood() {
    init_tracing();
    let (replicator, env) = replicator();
    env.push_script(Script::completing(Vec::new()));
    let flood: Vec<_> = (1..=2000).map(|seq| pulled(1, seq)).collect();
    env.push_script(Script::live(flood));

    let running = {
        let replicator = replicator.clone();
        tokio::spawn(async move { replicator.open_replication(&settings(), true, false, false).await })
    };
    timeout(Duration::from_secs(5), async {
        while replicator.stat().arrived < 10 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("events flow");

    replicator.close_replication();
    let result = timeout(Duration::from_secs(5), running)
        .await
        .expect("session ends after close")
        .unwrap();
    assert!(result.unwrap());
    assert_eq!(replicator.sync_status(), SyncStatus::Closed);
    assert!(replicator.stat().arrived <= 2000);
    assert!(!replicator.is_session_active());

    // The slot is free again
    assert!(replicator
        .open_one_shot_replication(&settings(), false, false, SyncMode::PullOnly, false)
        .await
        .unwrap());
}

/// Test: A replication that never reports anything can still be closed
#[tokio::test]
async fn silent_replication_can_be_closed() {
    let (replicator, env) = replicator();
    env.push_script(Script::live(Vec::new()));

    let running = {
        let replicator = replicator.clone();
        tokio::spawn(async move {
            replicator
                .open_one_shot_replication(&settings(), false, false, SyncMode::Sync, false)
                .await
        })
    };
    timeout(Duration::from_secs(5), async {
        while env.local().requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    replicator.close_replication();
    let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    assert!(!result.unwrap());
    assert_eq!(env.local().cancels(), 1);
}

/// Test: Many concurrent one-shot callers never open more than one session
#[tokio::test]
async fn concurrent_callers_single_session() {
    let (replicator, env) = replicator();
    env.push_script(Script::completing(vec![pulled(1, 1)]).with_delay(Duration::from_millis(20)));

    let mut callers = Vec::new();
    for _ in 0..16 {
        let replicator = replicator.clone();
        callers.push(tokio::spawn(async move {
            replicator
                .open_one_shot_replication(&settings(), false, false, SyncMode::Sync, false)
                .await
        }));
    }
    for caller in callers {
        assert!(caller.await.unwrap().unwrap());
    }
    assert_eq!(env.local().requests().len(), 1);
    assert_eq!(replicator.stat().arrived, 1);

    let remote_info = env.remote().info().await.unwrap();
    assert!(remote_info.doc_count >= 2);
}
