// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk chunk sender.
//!
//! A maintenance tool that uploads local chunks the remote lacks, outside the
//! replication protocol. It is not part of normal sessions and does not use
//! the pacing controller; uploads are limited by their own bulkhead.
//!
//! # Flow
//!
//! ```text
//! local changes (type = leaf, since maxSeq)
//!      │  skip seqs already marked sent
//!      ▼
//! remote all_docs in groups of 250 ──► present: mark sent
//!      │ not_found
//!      ▼
//! task queue "send-chunks"
//!      │ drain
//!      ▼
//! batches (≤ 200 docs, ≤ bulk max bytes) ──► bulk_docs(new_edits = false), 4 at a time
//!      │ per batch
//!      ▼
//! mark sent, update maxSeq
//! ```

use super::types::SyncStatus;
use super::LiveSyncReplicator;
use crate::chunk_seq::{load_max_seq_on_chunk, update_max_transferred_seq};
use crate::config::RemoteDbSettings;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{seq_of, MilestoneInfo, RawDocument, MILESTONE_DOCID};
use crate::remote::connect_remote_with_setting;
use crate::resilience::Bulkhead;
use crate::store::{get_typed, ChangesRequest, Database, RemoteConnection, ReplicatorEnv};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Task-queue topic of chunks waiting for upload.
pub const SEND_CHUNKS_TOPIC: &str = "send-chunks";

const REMOTE_CHECK_GROUP: usize = 250;
const MAX_DOCS_PER_BULK: usize = 200;
const DOC_OVERHEAD_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedChunk {
    seq: u64,
    doc: RawDocument,
    id: String,
}

/// Split `(item, size)` pairs into batches of at most `max_docs` items and
/// `max_bytes` total size.
///
/// An item larger than `max_bytes` still goes out, alone.
pub fn plan_batches<T>(items: Vec<(T, usize)>, max_docs: usize, max_bytes: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;
    for (item, size) in items {
        if !current.is_empty() && (current.len() >= max_docs || current_bytes + size > max_bytes) {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(item);
        current_bytes += size;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn wire_size(doc: &RawDocument) -> usize {
    serde_json::to_vec(doc).map_or(0, |bytes| bytes.len()) + DOC_OVERHEAD_BYTES
}

impl<E: ReplicatorEnv> LiveSyncReplicator<E> {
    /// Upload local chunks missing on the remote.
    ///
    /// Scans from `from_seq`, or from the recorded max sequence for this
    /// remote. Returns `Ok(false)` if any batch failed; progress made by
    /// the other batches is kept.
    pub async fn send_chunks(
        &self,
        settings: &RemoteDbSettings,
        remote: Option<RemoteConnection>,
        show_result: bool,
        from_seq: Option<u64>,
    ) -> Result<bool> {
        let queue = self.inner.env.task_queue();
        queue
            .erase_all()
            .await
            .map_err(|e| ReplicationError::store("erase task queue", e))?;

        let remote = match remote {
            Some(remote) => remote,
            None => connect_remote_with_setting(self.inner.env.as_ref(), settings, false, false).await?,
        };
        let milestone = get_typed::<MilestoneInfo>(remote.db.as_ref(), MILESTONE_DOCID)
            .await
            .map_err(|e| ReplicationError::store("get milestone", e))?
            .ok_or(ReplicationError::MilestoneMissing)?;
        let remote_id = milestone.created.to_string();
        self.set_status(SyncStatus::Connected);

        let local = self.inner.env.local_database();
        let bookkeeping = load_max_seq_on_chunk(local.as_ref(), &remote_id).await;
        let since = from_seq.unwrap_or(bookkeeping.max_seq);
        notice!(show_result, since, "Scanning local chunks");

        let changes = local
            .changes(ChangesRequest {
                since: json!(since),
                include_docs: true,
                selector: Some(json!({ "type": "leaf" })),
            })
            .await
            .map_err(|e| ReplicationError::store("local changes", e))?;
        let candidates: Vec<QueuedChunk> = changes
            .into_iter()
            .filter(|row| !row.deleted)
            .filter_map(|row| {
                let seq = seq_of(&row.seq);
                let doc = row.doc?;
                (!bookkeeping.is_sent(seq)).then_some(QueuedChunk { seq, doc, id: row.id })
            })
            .collect();
        debug!(count = candidates.len(), "Chunk candidates");

        for group in candidates.chunks(REMOTE_CHECK_GROUP) {
            let keys = group.iter().map(|c| c.id.clone()).collect();
            let rows = remote
                .db
                .all_docs(keys, false)
                .await
                .map_err(|e| ReplicationError::store("remote all_docs", e))?;

            let mut statuses = BTreeMap::new();
            let mut missing = Vec::new();
            for (chunk, row) in group.iter().zip(rows.iter()) {
                if row.is_not_found() {
                    statuses.insert(chunk.seq, false);
                    let item = serde_json::to_value(chunk).map_err(|e| ReplicationError::Internal(e.to_string()))?;
                    missing.push(item);
                } else {
                    statuses.insert(chunk.seq, true);
                }
            }
            if !missing.is_empty() {
                queue
                    .queue(SEND_CHUNKS_TOPIC, missing)
                    .await
                    .map_err(|e| ReplicationError::store("queue chunks", e))?;
            }
            update_max_transferred_seq(local.as_ref(), &remote_id, &statuses).await?;
        }

        let mut pending = Vec::new();
        while let Some(items) = queue
            .dequeue(SEND_CHUNKS_TOPIC)
            .await
            .map_err(|e| ReplicationError::store("dequeue chunks", e))?
        {
            for item in items {
                match serde_json::from_value::<QueuedChunk>(item) {
                    Ok(chunk) => {
                        let size = wire_size(&chunk.doc);
                        pending.push((chunk, size));
                    }
                    Err(e) => warn!(error = %e, "Skipping malformed queued chunk"),
                }
            }
        }
        if pending.is_empty() {
            notice!(show_result, "No chunks to send");
            return Ok(true);
        }

        let batches = plan_batches(pending, MAX_DOCS_PER_BULK, settings.send_chunks_bulk_max_bytes());
        let total = batches.len();
        let bulkhead = Bulkhead::for_chunk_upload();
        let bookkeeping_lock = Mutex::new(());

        let results = join_all(batches.into_iter().enumerate().map(|(index, batch)| {
            let remote_db = remote.db.as_ref();
            let local_db = local.as_ref();
            let bulkhead = &bulkhead;
            let bookkeeping_lock = &bookkeeping_lock;
            let remote_id = remote_id.as_str();
            async move {
                let _permit = bulkhead
                    .acquire()
                    .await
                    .map_err(|e| ReplicationError::Internal(e.to_string()))?;
                send_batch(remote_db, local_db, remote_id, bookkeeping_lock, batch, index, total, show_result).await
            }
        }))
        .await;

        let failed = results.iter().filter(|r| !matches!(r, Ok(true))).count();
        if failed > 0 {
            warn!(failed, total, "Some chunk batches could not be sent");
            return Ok(false);
        }
        info!(total, "Send chunks completed");
        Ok(true)
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_batch(
    remote: &dyn Database,
    local: &dyn Database,
    remote_id: &str,
    bookkeeping_lock: &Mutex<()>,
    batch: Vec<QueuedChunk>,
    index: usize,
    total: usize,
    show_result: bool,
) -> Result<bool> {
    let count = batch.len();
    let mut bytes = 0usize;
    let mut seqs = Vec::with_capacity(count);
    let mut docs = Vec::with_capacity(count);
    for chunk in batch {
        bytes += wire_size(&chunk.doc);
        seqs.push(chunk.seq);
        docs.push(chunk.doc);
    }

    let sent = match remote.bulk_docs(docs, false).await {
        Ok(results) => results.iter().all(|r| r.is_ok()),
        Err(e) => {
            warn!(error = %e, batch = index + 1, total, "Chunk batch upload failed");
            false
        }
    };
    metrics::record_chunks_sent(count, bytes, sent);
    if !sent {
        return Ok(false);
    }

    let statuses: BTreeMap<u64, bool> = seqs.into_iter().map(|seq| (seq, true)).collect();
    let _guard = bookkeeping_lock.lock().await;
    update_max_transferred_seq(local, remote_id, &statuses).await?;
    notice!(show_result, "Sent chunk batch {}/{} ({} docs)", index + 1, total, count);
    Ok(true)
}
