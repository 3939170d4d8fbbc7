// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Eden: chunk incubation inside an entry.
//!
//! Freshly created chunks of a frequently edited file are usually rewritten
//! again within a few saves. Instead of writing each one as a standalone
//! leaf, the entry keeps them in its own `eden` map for a while. A chunk
//! graduates to a standalone [`EntryLeaf`] once it is old enough or once
//! the map grows past its bounds.
//!
//! ```text
//!   new chunks ──► incubate() ──┬──► eden map (epoch-stamped)
//!                               │          │
//!                               │          │ age > max_age
//!                               │          │ count > max_chunks
//!                               │          │ length > max_total_length
//!                               │          ▼
//!                               └──────► standalone leaves
//! ```
//!
//! After every [`EdenMap::incubate`] call the map holds at most
//! `max_chunks` chunks, at most `max_total_length` bytes, and no chunk older
//! than `max_age` epochs. [`save_entry`] ties this to a database: graduates
//! are written as leaves before the entry that no longer embeds them.

use crate::error::{ReplicationError, Result};
use crate::model::{EntryDoc, EntryLeaf};
use crate::store::{Database, PutResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// A chunk incubating inside an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdenChunk {
    pub data: String,
    /// Entry write counter at which the chunk was first incubated.
    pub epoch: u64,
}

/// Bounds applied on every incubation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdenConfig {
    pub enabled: bool,
    pub max_chunks: usize,
    /// Total bytes of incubating data.
    pub max_total_length: usize,
    /// Epochs a chunk may stay before it graduates.
    pub max_age: u64,
}

impl Default for EdenConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_chunks: 10,
            max_total_length: 1024,
            max_age: 10,
        }
    }
}

/// The per-entry map of incubating chunks, keyed by chunk id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdenMap(BTreeMap<String, EdenChunk>);

impl EdenMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&EdenChunk> {
        self.0.get(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_length(&self) -> usize {
        self.0.values().map(|c| c.data.len()).sum()
    }

    /// Ids currently incubating, in id order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Insert a chunk without applying bounds. An existing chunk keeps its epoch.
    pub fn insert(&mut self, id: impl Into<String>, data: impl Into<String>, epoch: u64) {
        self.0.entry(id.into()).or_insert_with(|| EdenChunk {
            data: data.into(),
            epoch,
        });
    }

    /// Incubate `new_chunks` at `epoch` and graduate whatever breaks a bound.
    ///
    /// Returns the chunks that must be written as standalone leaves: new
    /// chunks that were never incubated plus graduates, in that order.
    pub fn incubate(
        &mut self,
        new_chunks: Vec<EntryLeaf>,
        epoch: u64,
        config: &EdenConfig,
    ) -> Vec<EntryLeaf> {
        let mut standalone = Vec::new();

        for chunk in new_chunks {
            if !config.enabled || chunk.data.len() > config.max_total_length {
                standalone.push(chunk);
                continue;
            }
            self.insert(chunk.id, chunk.data, epoch);
        }

        // Age first, then size pressure oldest-first.
        let expired: Vec<String> = self
            .0
            .iter()
            .filter(|(_, c)| epoch.saturating_sub(c.epoch) > config.max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            standalone.extend(self.graduate(&id));
        }

        while self.len() > config.max_chunks || self.total_length() > config.max_total_length {
            let Some(oldest) = self.oldest() else { break };
            standalone.extend(self.graduate(&oldest));
        }

        standalone
    }

    /// Drop incubating chunks the entry no longer references.
    pub fn forget_unreferenced<S: AsRef<str>>(&mut self, children: &[S]) {
        self.0
            .retain(|id, _| children.iter().any(|c| c.as_ref() == id));
    }

    /// Lowest epoch, ties broken by id.
    fn oldest(&self) -> Option<String> {
        self.0
            .iter()
            .min_by(|(a_id, a), (b_id, b)| a.epoch.cmp(&b.epoch).then_with(|| a_id.cmp(b_id)))
            .map(|(id, _)| id.clone())
    }

    fn graduate(&mut self, id: &str) -> Option<EntryLeaf> {
        self.0
            .remove(id)
            .map(|chunk| EntryLeaf::new(id, chunk.data))
    }
}

/// Write an entry together with the chunks produced for it.
///
/// Chunks the entry no longer references are dropped from its Eden map,
/// `new_chunks` are incubated at `epoch`, and everything that has to stand
/// alone is written with one `bulk_docs` call before the entry itself. A
/// leaf that already exists is fine: identical ids carry identical content.
pub async fn save_entry(
    db: &dyn Database,
    mut entry: EntryDoc,
    new_chunks: Vec<EntryLeaf>,
    epoch: u64,
    config: &EdenConfig,
) -> Result<PutResponse> {
    let standalone = match &mut entry {
        EntryDoc::NewNote(e) | EntryDoc::Plain(e) => {
            e.eden.forget_unreferenced(&e.children);
            e.eden.incubate(new_chunks, epoch, config)
        }
        EntryDoc::Note(e) => e.eden.incubate(new_chunks, epoch, config),
        EntryDoc::Leaf(leaf) => {
            return Err(ReplicationError::Internal(format!(
                "{} is a chunk, not an entry",
                leaf.id
            )))
        }
    };

    if !standalone.is_empty() {
        let count = standalone.len();
        let docs = standalone.iter().map(EntryLeaf::to_document).collect();
        let results = db
            .bulk_docs(docs, true)
            .await
            .map_err(|e| ReplicationError::store("write standalone chunks", e))?;
        if let Some(failed) = results
            .iter()
            .find(|r| !r.is_ok() && r.error.as_deref() != Some("conflict"))
        {
            return Err(ReplicationError::Internal(format!(
                "chunk {} not written: {}",
                failed.id,
                failed.reason.as_deref().or(failed.error.as_deref()).unwrap_or("unknown")
            )));
        }
        debug!(entry = entry.id(), count, "Wrote standalone chunks");
    }

    let doc = serde_json::to_value(&entry).map_err(|e| ReplicationError::Internal(e.to_string()))?;
    db.put(doc)
        .await
        .map_err(|e| ReplicationError::store("write entry", e))
}
