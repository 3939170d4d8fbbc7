// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sent-sequence bookkeeping for the bulk chunk sender.
//!
//! Stored in the local replica as `_local/max_seq_on_chunk-<remoteId>`, one
//! document per remote (the remote id is the milestone's `created`
//! timestamp, so a rebuilt remote starts from scratch).
//!
//! # Max Seq Semantics
//!
//! Batches finish out of order, so the document keeps a status per local
//! sequence. `maxSeq` is the last sequence of the contiguous run of sent
//! sequences starting at the lowest recorded one:
//!
//! ```text
//! seqStatusMap  {3: true, 5: true, 8: false, 9: true}
//! maxSeq        5      (8 is still pending, 9 does not count yet)
//! ```
//!
//! A restart resumes the scan from `maxSeq`; sequences above it that are
//! already marked sent are skipped.

use crate::error::{ReplicationError, Result};
use crate::store::{get_typed, put_typed, Database};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const MAX_SEQ_ON_CHUNK_PREFIX: &str = "_local/max_seq_on_chunk-";

pub fn max_seq_doc_id(remote_id: &str) -> String {
    format!("{}{}", MAX_SEQ_ON_CHUNK_PREFIX, remote_id)
}

/// The bookkeeping document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaxSeqOnChunk {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "maxSeq", default)]
    pub max_seq: u64,
    #[serde(rename = "remoteID", default)]
    pub remote_id: String,
    #[serde(rename = "seqStatusMap", default)]
    pub seq_status_map: BTreeMap<u64, bool>,
}

impl MaxSeqOnChunk {
    pub fn new(remote_id: &str) -> Self {
        Self {
            id: max_seq_doc_id(remote_id),
            rev: None,
            max_seq: 0,
            remote_id: remote_id.to_string(),
            seq_status_map: BTreeMap::new(),
        }
    }

    /// Merge statuses (incoming wins) and recompute `max_seq`.
    pub fn merge(&mut self, statuses: &BTreeMap<u64, bool>) {
        self.seq_status_map
            .extend(statuses.iter().map(|(seq, sent)| (*seq, *sent)));
        self.max_seq = contiguous_max_seq(&self.seq_status_map);
    }

    pub fn is_sent(&self, seq: u64) -> bool {
        self.seq_status_map.get(&seq).copied().unwrap_or(false)
    }
}

/// Last sequence of the run of `true` starting at the lowest key; 0 if the
/// lowest key is not sent.
pub fn contiguous_max_seq(statuses: &BTreeMap<u64, bool>) -> u64 {
    statuses
        .iter()
        .take_while(|(_, sent)| **sent)
        .last()
        .map_or(0, |(seq, _)| *seq)
}

/// Load the bookkeeping document; a fresh one if absent or unreadable.
pub async fn load_max_seq_on_chunk(local: &dyn Database, remote_id: &str) -> MaxSeqOnChunk {
    let id = max_seq_doc_id(remote_id);
    match get_typed::<MaxSeqOnChunk>(local, &id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => MaxSeqOnChunk::new(remote_id),
        Err(e) => {
            debug!(remote_id, error = %e, "Max seq bookkeeping unreadable, starting over");
            MaxSeqOnChunk::new(remote_id)
        }
    }
}

/// Highest contiguously sent local sequence for `remote_id`.
pub async fn get_last_transferred_seq(local: &dyn Database, remote_id: &str) -> u64 {
    load_max_seq_on_chunk(local, remote_id).await.max_seq
}

/// Record `statuses` and persist. Returns the new `max_seq`.
///
/// Callers running batches concurrently must serialize calls; a lost
/// revision race surfaces as a store conflict.
pub async fn update_max_transferred_seq(
    local: &dyn Database,
    remote_id: &str,
    statuses: &BTreeMap<u64, bool>,
) -> Result<u64> {
    let mut doc = load_max_seq_on_chunk(local, remote_id).await;
    doc.merge(statuses);
    match put_typed(local, &doc).await {
        Ok(_) => {
            debug!(remote_id, max_seq = doc.max_seq, "Max seq on chunks updated");
            Ok(doc.max_seq)
        }
        Err(e) => {
            warn!(remote_id, error = %e, "Could not persist max seq on chunks");
            Err(ReplicationError::store("update max seq on chunks", e))
        }
    }
}
