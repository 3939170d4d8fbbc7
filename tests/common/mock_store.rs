//! In-memory CouchDB-like stores for testing.
//!
//! [`MockDatabase`] keeps revisions, a change feed, and detects revision
//! conflicts. Failures can be injected per operation.
//! [`MockLocalDatabase`] wraps one and plays scripted replication events.

use livesync_replicator::model::{seq_of, RawDocument};
use livesync_replicator::store::{
    AllDocsRow, AllDocsValue, BoxFuture, BulkResult, ChangeRow, ChangesRequest, Database, DatabaseInfo,
    DatabaseSizes, LocalDatabase, PutResponse, ReplicationHandle, ReplicationRequest,
};
use livesync_replicator::stream::{EventSink, ReplicationEvent};
use livesync_replicator::StoreError;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct StoredDoc {
    generation: u64,
    seq: u64,
    doc: Value,
}

/// A CouchDB-like document store.
///
/// # Example
/// ```rust,ignore
/// let db = MockDatabase::new("remote");
/// db.inject_put_conflicts(2);
/// db.seed(json!({"_id": "h:abc", "type": "leaf", "data": "x"})).await;
/// ```
pub struct MockDatabase {
    name: String,
    docs: RwLock<BTreeMap<String, StoredDoc>>,
    seq: AtomicU64,
    /// Puts to reject with a conflict before accepting again
    put_conflicts: AtomicUsize,
    /// Gets to reject with a server error
    get_failures: AtomicUsize,
    /// bulk_docs calls to reject with a server error
    bulk_failures: AtomicUsize,
    bulk_calls: Mutex<Vec<Vec<RawDocument>>>,
    compact_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl MockDatabase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            docs: RwLock::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            put_conflicts: AtomicUsize::new(0),
            get_failures: AtomicUsize::new(0),
            bulk_failures: AtomicUsize::new(0),
            bulk_calls: Mutex::new(Vec::new()),
            compact_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        }
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    pub fn inject_put_conflicts(&self, n: usize) {
        self.put_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn inject_get_failures(&self, n: usize) {
        self.get_failures.store(n, Ordering::SeqCst);
    }

    pub fn inject_bulk_failures(&self, n: usize) {
        self.bulk_failures.store(n, Ordering::SeqCst);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Write a document directly, bypassing revision checks.
    pub async fn seed(&self, doc: Value) {
        let id = doc["_id"].as_str().unwrap_or_default().to_string();
        let mut docs = self.docs.write().await;
        let generation = docs.get(&id).map_or(1, |d| d.generation + 1);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut doc = doc;
        doc["_rev"] = json!(format!("{}-seed", generation));
        docs.insert(id, StoredDoc { generation, seq, doc });
    }

    pub async fn doc(&self, id: &str) -> Option<Value> {
        self.docs.read().await.get(id).map(|d| d.doc.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.docs.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub fn bulk_calls(&self) -> Vec<Vec<RawDocument>> {
        self.bulk_calls.lock().unwrap().clone()
    }

    pub fn compact_calls(&self) -> usize {
        self.compact_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn server_error() -> StoreError {
        StoreError::Status {
            status: 500,
            message: "injected failure".to_string(),
        }
    }

    async fn store(&self, mut doc: Value, rev: Option<String>) -> String {
        let id = doc["_id"].as_str().unwrap_or_default().to_string();
        let mut docs = self.docs.write().await;
        let generation = docs.get(&id).map_or(1, |d| d.generation + 1);
        let rev = rev.unwrap_or_else(|| format!("{}-mock", generation));
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        doc["_rev"] = json!(rev.clone());
        docs.insert(id, StoredDoc { generation, seq, doc });
        rev
    }
}

fn matches_selector(doc: &Value, selector: &Option<Value>) -> bool {
    let Some(Value::Object(fields)) = selector else {
        return true;
    };
    fields.iter().all(|(key, expected)| match expected {
        Value::Object(op) => match op.get("$ne") {
            Some(excluded) => doc.get(key) != Some(excluded),
            None => true,
        },
        _ => doc.get(key) == Some(expected),
    })
}

impl Database for MockDatabase {
    fn info(&self) -> BoxFuture<'_, DatabaseInfo> {
        Box::pin(async move {
            let docs = self.docs.read().await;
            Ok(DatabaseInfo {
                db_name: self.name.clone(),
                doc_count: docs.len() as u64,
                update_seq: json!(format!("{}-mock", self.seq.load(Ordering::SeqCst))),
                sizes: DatabaseSizes {
                    file: 4096 * docs.len() as u64,
                    active: 0,
                    external: 0,
                },
            })
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, RawDocument> {
        let id = id.to_string();
        Box::pin(async move {
            if Self::take_failure(&self.get_failures) {
                return Err(Self::server_error());
            }
            self.docs
                .read()
                .await
                .get(&id)
                .map(|d| d.doc.clone())
                .ok_or(StoreError::NotFound(id))
        })
    }

    fn put(&self, doc: RawDocument) -> BoxFuture<'_, PutResponse> {
        Box::pin(async move {
            let id = doc["_id"].as_str().unwrap_or_default().to_string();
            if Self::take_failure(&self.put_conflicts) {
                return Err(StoreError::Conflict(id));
            }
            let current = self.docs.read().await.get(&id).map(|d| d.doc["_rev"].clone());
            let given = doc.get("_rev").cloned().filter(|v| !v.is_null());
            if current != given {
                return Err(StoreError::Conflict(id));
            }
            let rev = self.store(doc, None).await;
            Ok(PutResponse { ok: true, id, rev })
        })
    }

    fn bulk_docs(&self, docs: Vec<RawDocument>, new_edits: bool) -> BoxFuture<'_, Vec<BulkResult>> {
        Box::pin(async move {
            self.bulk_calls.lock().unwrap().push(docs.clone());
            if Self::take_failure(&self.bulk_failures) {
                return Err(Self::server_error());
            }
            let mut results = Vec::with_capacity(docs.len());
            for doc in docs {
                let id = doc["_id"].as_str().unwrap_or_default().to_string();
                let given = if new_edits {
                    None
                } else {
                    doc.get("_rev").and_then(Value::as_str).map(str::to_string)
                };
                let rev = self.store(doc, given).await;
                results.push(BulkResult {
                    id,
                    rev: Some(rev),
                    error: None,
                    reason: None,
                });
            }
            Ok(results)
        })
    }

    fn all_docs(&self, keys: Vec<String>, include_docs: bool) -> BoxFuture<'_, Vec<AllDocsRow>> {
        Box::pin(async move {
            let docs = self.docs.read().await;
            Ok(keys
                .into_iter()
                .map(|key| match docs.get(&key) {
                    Some(stored) => AllDocsRow {
                        id: Some(key.clone()),
                        value: Some(AllDocsValue {
                            rev: stored.doc["_rev"].as_str().unwrap_or_default().to_string(),
                            deleted: None,
                        }),
                        doc: include_docs.then(|| stored.doc.clone()),
                        error: None,
                        key,
                    },
                    None => AllDocsRow {
                        key,
                        id: None,
                        value: None,
                        doc: None,
                        error: Some("not_found".to_string()),
                    },
                })
                .collect())
        })
    }

    fn changes(&self, request: ChangesRequest) -> BoxFuture<'_, Vec<ChangeRow>> {
        Box::pin(async move {
            let since = seq_of(&request.since);
            let docs = self.docs.read().await;
            let mut rows: Vec<ChangeRow> = docs
                .iter()
                .filter(|(_, d)| d.seq > since && matches_selector(&d.doc, &request.selector))
                .map(|(id, d)| ChangeRow {
                    id: id.clone(),
                    seq: json!(d.seq),
                    doc: request.include_docs.then(|| d.doc.clone()),
                    deleted: false,
                })
                .collect();
            rows.sort_by_key(|r| seq_of(&r.seq));
            Ok(rows)
        })
    }

    fn destroy(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.destroy_calls.fetch_add(1, Ordering::SeqCst);
            self.docs.write().await.clear();
            Ok(())
        })
    }

    fn compact(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.compact_calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
    }
}

// =============================================================================
// Scripted replication
// =============================================================================

/// Events one `replicate()` call plays back.
#[derive(Debug, Clone)]
pub struct Script {
    pub events: Vec<ReplicationEvent>,
    /// Keep the sink (and the replication) open until cancelled
    pub hold_open: bool,
    /// Pause before each event
    pub delay: Duration,
}

impl Script {
    pub fn of(events: Vec<ReplicationEvent>) -> Self {
        Self {
            events,
            hold_open: false,
            delay: Duration::ZERO,
        }
    }

    /// Events followed by `Complete` and `Finally`.
    pub fn completing(mut events: Vec<ReplicationEvent>) -> Self {
        events.push(ReplicationEvent::Complete);
        events.push(ReplicationEvent::Finally);
        Self::of(events)
    }

    pub fn live(events: Vec<ReplicationEvent>) -> Self {
        Self {
            hold_open: true,
            ..Self::of(events)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct MockHandle {
    cancel: CancellationToken,
    cancels: Arc<AtomicUsize>,
}

impl ReplicationHandle for MockHandle {
    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// Local replica whose `replicate()` plays queued [`Script`]s.
///
/// With no script queued, a replication completes immediately.
pub struct MockLocalDatabase {
    db: Arc<MockDatabase>,
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ReplicationRequest>>,
    cancels: Arc<AtomicUsize>,
}

impl MockLocalDatabase {
    pub fn new() -> Self {
        Self {
            db: Arc::new(MockDatabase::new("local")),
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            cancels: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn store(&self) -> &Arc<MockDatabase> {
        &self.db
    }

    pub fn push_script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Every replication request received, in order.
    pub fn requests(&self) -> Vec<ReplicationRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of `cancel()` calls on handles.
    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl Database for MockLocalDatabase {
    fn info(&self) -> BoxFuture<'_, DatabaseInfo> {
        self.db.info()
    }

    fn get(&self, id: &str) -> BoxFuture<'_, RawDocument> {
        self.db.get(id)
    }

    fn put(&self, doc: RawDocument) -> BoxFuture<'_, PutResponse> {
        self.db.put(doc)
    }

    fn bulk_docs(&self, docs: Vec<RawDocument>, new_edits: bool) -> BoxFuture<'_, Vec<BulkResult>> {
        self.db.bulk_docs(docs, new_edits)
    }

    fn all_docs(&self, keys: Vec<String>, include_docs: bool) -> BoxFuture<'_, Vec<AllDocsRow>> {
        self.db.all_docs(keys, include_docs)
    }

    fn changes(&self, request: ChangesRequest) -> BoxFuture<'_, Vec<ChangeRow>> {
        self.db.changes(request)
    }

    fn destroy(&self) -> BoxFuture<'_, ()> {
        self.db.destroy()
    }

    fn compact(&self) -> BoxFuture<'_, bool> {
        self.db.compact()
    }
}

impl LocalDatabase for MockLocalDatabase {
    fn replicate(
        &self,
        _remote: Arc<dyn Database>,
        request: ReplicationRequest,
        sink: EventSink,
    ) -> Box<dyn ReplicationHandle> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::completing(Vec::new()));
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            for event in script.events {
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                if token.is_cancelled() || !sink.post(event).await {
                    return;
                }
            }
            if script.hold_open {
                token.cancelled().await;
            }
        });

        Box::new(MockHandle {
            cancel,
            cancels: Arc::clone(&self.cancels),
        })
    }
}
