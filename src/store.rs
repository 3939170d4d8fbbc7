// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator interfaces.
//!
//! The replicator never talks HTTP and never touches the host's storage
//! directly. Everything it needs from the outside world comes through the
//! traits in this module:
//!
//! - [`Database`]: a CouchDB-like document store (the remote, and the local
//!   replica).
//! - [`LocalDatabase`]: the local replica, which can also open a replication
//!   against a remote and report progress as [`ReplicationEvent`]s.
//! - [`TaskQueue`]: a small persistent work queue used by the bulk chunk
//!   sender.
//! - [`ReplicatorEnv`]: the host environment (connection factory, settings,
//!   incoming-document handler).
//!
//! # Example
//!
//! ```rust,no_run
//! use livesync_replicator::store::{BoxFuture, ReplicationHandle, TaskQueue};
//! use serde_json::Value;
//!
//! struct NoopHandle;
//!
//! impl ReplicationHandle for NoopHandle {
//!     fn cancel(&self) {}
//! }
//!
//! struct NullQueue;
//!
//! impl TaskQueue for NullQueue {
//!     fn queue(&self, _topic: &str, _items: Vec<Value>) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn dequeue(&self, _topic: &str) -> BoxFuture<'_, Option<Vec<Value>>> {
//!         Box::pin(async { Ok(None) })
//!     }
//!     fn erase_all(&self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```
//!
//! [`ReplicationEvent`]: crate::stream::ReplicationEvent

use crate::config::RemoteDbSettings;
use crate::error::{StoreError, StoreResult};
use crate::model::RawDocument;
use crate::stream::EventSink;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Wire shapes
// ═══════════════════════════════════════════════════════════════════════════════

/// Byte sizes reported by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSizes {
    #[serde(default)]
    pub file: u64,
    #[serde(default)]
    pub active: u64,
    #[serde(default)]
    pub external: u64,
}

/// Result of `info()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    #[serde(default)]
    pub db_name: String,
    #[serde(default)]
    pub doc_count: u64,
    /// String on CouchDB, number on embedded stores.
    #[serde(default)]
    pub update_seq: Value,
    #[serde(default)]
    pub sizes: DatabaseSizes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutResponse {
    pub ok: bool,
    pub id: String,
    pub rev: String,
}

/// Per-document outcome of `bulk_docs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkResult {
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllDocsValue {
    pub rev: String,
    #[serde(default)]
    pub deleted: Option<bool>,
}

/// One row of `all_docs` with explicit keys.
///
/// Rows for absent keys carry `error` (usually `"not_found"`) and no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllDocsRow {
    pub key: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub value: Option<AllDocsValue>,
    #[serde(default)]
    pub doc: Option<RawDocument>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AllDocsRow {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_not_found(&self) -> bool {
        self.error.as_deref() == Some("not_found")
    }
}

/// One row of a non-live `changes` scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub id: String,
    pub seq: Value,
    #[serde(default)]
    pub doc: Option<RawDocument>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesRequest {
    pub since: Value,
    pub include_docs: bool,
    #[serde(default)]
    pub selector: Option<Value>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replication request
// ═══════════════════════════════════════════════════════════════════════════════

/// Direction(s) of a replication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Bidirectional.
    Sync,
    PullOnly,
    PushOnly,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Sync => write!(f, "sync"),
            SyncMode::PullOnly => write!(f, "pullOnly"),
            SyncMode::PushOnly => write!(f, "pushOnly"),
        }
    }
}

/// Options handed to the replication collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub batch_size: u32,
    pub batches_limit: u32,
    /// Selector applied to the pull side (skips chunks when reading online).
    pub pull_selector: Option<Value>,
    pub live: bool,
    pub retry: bool,
    /// `None` disables the heartbeat.
    pub heartbeat: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationRequest {
    pub mode: SyncMode,
    pub options: SyncOptions,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// A CouchDB-like document store.
pub trait Database: Send + Sync + 'static {
    fn info(&self) -> BoxFuture<'_, DatabaseInfo>;

    /// Fetch a document. Missing documents fail with [`StoreError::NotFound`].
    fn get(&self, id: &str) -> BoxFuture<'_, RawDocument>;

    /// Write a document. A stale `_rev` fails with [`StoreError::Conflict`].
    fn put(&self, doc: RawDocument) -> BoxFuture<'_, PutResponse>;

    /// Write many documents. With `new_edits = false` the given revisions
    /// are stored as-is.
    fn bulk_docs(&self, docs: Vec<RawDocument>, new_edits: bool) -> BoxFuture<'_, Vec<BulkResult>>;

    /// Look up `keys`, one row per key in order.
    fn all_docs(&self, keys: Vec<String>, include_docs: bool) -> BoxFuture<'_, Vec<AllDocsRow>>;

    /// Scan the change feed once (non-live).
    fn changes(&self, request: ChangesRequest) -> BoxFuture<'_, Vec<ChangeRow>>;

    fn destroy(&self) -> BoxFuture<'_, ()>;

    fn compact(&self) -> BoxFuture<'_, bool>;
}

/// A running replication opened by [`LocalDatabase::replicate`].
pub trait ReplicationHandle: Send + Sync {
    /// Stop the replication. Must be safe to call more than once.
    fn cancel(&self);
}

/// The local replica.
pub trait LocalDatabase: Database {
    /// Start replicating against `remote`.
    ///
    /// Progress is posted to `sink`. The implementation drops every clone of
    /// the sink once the replication has settled, after posting
    /// [`ReplicationEvent::Finally`](crate::stream::ReplicationEvent::Finally).
    fn replicate(
        &self,
        remote: Arc<dyn Database>,
        request: ReplicationRequest,
        sink: EventSink,
    ) -> Box<dyn ReplicationHandle>;
}

/// A persistent FIFO of JSON batches, grouped by topic.
pub trait TaskQueue: Send + Sync {
    fn queue(&self, topic: &str, items: Vec<Value>) -> BoxFuture<'_, ()>;

    /// Remove and return the oldest batch under `topic`.
    fn dequeue(&self, topic: &str) -> BoxFuture<'_, Option<Vec<Value>>>;

    /// Drop every batch of every topic.
    fn erase_all(&self) -> BoxFuture<'_, ()>;
}

/// Arguments of [`ReplicatorEnv::connect_remote`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub disable_request_uri: bool,
    /// `Some` when encryption is enabled.
    pub passphrase: Option<String>,
    pub use_dynamic_iteration_count: bool,
    /// Create the database if it does not exist.
    pub perform_setup: bool,
    /// Skip the `info()` round-trip.
    pub skip_info: bool,
    pub enable_compression: bool,
}

/// An opened remote.
#[derive(Clone)]
pub struct RemoteConnection {
    pub db: Arc<dyn Database>,
    pub info: DatabaseInfo,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// The host environment.
pub trait ReplicatorEnv: Send + Sync + 'static {
    /// Open (and optionally create) a remote database.
    fn connect_remote(&self, request: ConnectRequest) -> BoxFuture<'_, RemoteConnection>;

    fn local_database(&self) -> Arc<dyn LocalDatabase>;

    /// Hand pulled documents to the host.
    fn apply_incoming(&self, docs: Vec<RawDocument>) -> BoxFuture<'_, ()>;

    /// Current settings, as edited by the host.
    fn settings(&self) -> RemoteDbSettings;

    fn task_queue(&self) -> Arc<dyn TaskQueue>;

    /// Whether the transport's last POST was rejected for its size.
    fn last_post_failed_by_size(&self) -> bool;

    fn is_mobile(&self) -> bool {
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Typed helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Fetch and deserialize a document. `Ok(None)` when it does not exist.
pub async fn get_typed<T: DeserializeOwned>(db: &dyn Database, id: &str) -> StoreResult<Option<T>> {
    match db.get(id).await {
        Ok(doc) => serde_json::from_value(doc)
            .map(Some)
            .map_err(|e| StoreError::Other(format!("malformed document {}: {}", id, e))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Serialize and write a document.
pub async fn put_typed<T: Serialize>(db: &dyn Database, doc: &T) -> StoreResult<PutResponse> {
    let value = serde_json::to_value(doc).map_err(|e| StoreError::Other(e.to_string()))?;
    db.put(value).await
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory task queue
// ═══════════════════════════════════════════════════════════════════════════════

/// [`TaskQueue`] kept in memory; enough for hosts that do not need the
/// queue to survive a restart.
#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    topics: Mutex<HashMap<String, VecDeque<Vec<Value>>>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches waiting under `topic`.
    pub async fn pending(&self, topic: &str) -> usize {
        self.topics.lock().await.get(topic).map_or(0, VecDeque::len)
    }
}

impl TaskQueue for MemoryTaskQueue {
    fn queue(&self, topic: &str, items: Vec<Value>) -> BoxFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.topics
                .lock()
                .await
                .entry(topic)
                .or_default()
                .push_back(items);
            Ok(())
        })
    }

    fn dequeue(&self, topic: &str) -> BoxFuture<'_, Option<Vec<Value>>> {
        let topic = topic.to_string();
        Box::pin(async move {
            Ok(self
                .topics
                .lock()
                .await
                .get_mut(&topic)
                .and_then(VecDeque::pop_front))
        })
    }

    fn erase_all(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.topics.lock().await.clear();
            Ok(())
        })
    }
}
