//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - In-memory CouchDB-like stores with fault injection
//! - A scripted local replica that plays replication events
//! - A mock host environment and replicator constructors
//! - Log capture for `--nocapture` runs

#![allow(dead_code)]

pub mod mock_env;
pub mod mock_store;

pub use mock_env::*;
pub use mock_store::*;

use livesync_replicator::stream::{ChangeBatch, Direction, ReplicationEvent, TransferFailure};
use serde_json::{json, Value};

/// Show replicator logs under `--nocapture`, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `n` note documents named `<prefix>-<i>`.
pub fn docs(prefix: &str, n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| json!({"_id": format!("{}-{}", prefix, i), "type": "plain", "data": "x"}))
        .collect()
}

pub fn pulled(n: usize, last_seq: u64) -> ReplicationEvent {
    ReplicationEvent::Change(ChangeBatch {
        direction: Some(Direction::Pull),
        docs: docs("pulled", n),
        last_seq: json!(format!("{}-g1AAAA", last_seq)),
    })
}

pub fn pushed(n: usize, last_seq: u64) -> ReplicationEvent {
    ReplicationEvent::Change(ChangeBatch {
        direction: Some(Direction::Push),
        docs: docs("pushed", n),
        last_seq: json!(last_seq),
    })
}

/// A change without direction, as one-way replications report it.
pub fn undirected(n: usize, last_seq: u64) -> ReplicationEvent {
    ReplicationEvent::Change(ChangeBatch {
        direction: None,
        docs: docs("doc", n),
        last_seq: json!(last_seq),
    })
}

pub fn transient_error() -> ReplicationEvent {
    ReplicationEvent::Error(TransferFailure::new("socket hang up"))
}

pub fn leaf(id: &str, data: &str) -> Value {
    json!({"_id": id, "_rev": "1-leaf", "type": "leaf", "data": data})
}
