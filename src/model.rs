// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document shapes shared with every other node on the remote.
//!
//! These types mirror the JSON documents stored in the remote database, so
//! field names follow the stored format (`_id`, `_rev`, camelCase tweak keys)
//! rather than Rust conventions.
//!
//! # Document Kinds
//!
//! ```text
//! type          id                                   content
//! ----------    ---------------------------------    ------------------------------
//! notes         path-derived / f:<obfuscated>        inline data + eden
//! newnote       path-derived / f:<obfuscated>        children (leaf ids) + eden
//! plain         path-derived / f:<obfuscated>        children (leaf ids) + eden
//! leaf          h:<hash> / h:+<hash>                 one chunk of content
//! versioninfo   obsydian_livesync_version            remote protocol version
//! milestoneinfo _local/obsydian_livesync_milestone   locking + compatibility record
//! nodeinfo      _local/obsydian_livesync_nodeinfo    this replica's node id
//! ```

use crate::eden::EdenMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// A document as it travels through the replication stream.
pub type RawDocument = Value;

/// Protocol version this engine understands.
pub const VER: u32 = 10;

/// Id of the shared coordination document.
pub const MILESTONE_DOCID: &str = "_local/obsydian_livesync_milestone";

/// Id of the local document holding this replica's node id.
pub const NODEINFO_DOCID: &str = "_local/obsydian_livesync_nodeinfo";

/// Id of the remote protocol version document.
pub const VERSIONING_DOCID: &str = "obsydian_livesync_version";

/// Prefix of plain chunk ids.
pub const PREFIX_CHUNK: &str = "h:";

/// Prefix of encrypted chunk ids.
pub const PREFIX_ENCRYPTED_CHUNK: &str = "h:+";

/// Prefix of obfuscated entry ids.
pub const PREFIX_OBFUSCATED: &str = "f:";

/// Pseudo node id under which a preferred fingerprint is published.
pub const DEVICE_ID_PREFERRED: &str = "PREFERRED";

/// Chunk format versions this engine can read and write.
pub const CURRENT_VERSION_RANGE: ChunkVersionRange = ChunkVersionRange {
    min: 0,
    max: 2400,
    current: 2,
};

/// Parse a change-feed sequence into its numeric prefix.
///
/// CouchDB sequences look like `"1234-g1AAAA..."`; PouchDB uses plain
/// numbers. Anything unparseable counts as 0.
pub fn parse_seq(seq: &str) -> u64 {
    seq.split('-')
        .next()
        .and_then(|head| head.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

/// Numeric prefix of a sequence that may be a JSON string or number.
pub fn seq_of(seq: &Value) -> u64 {
    match seq {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => parse_seq(s),
        _ => 0,
    }
}

/// Default content-derived chunk identity.
///
/// Identical content always yields the identical id, which is what
/// deduplication depends on. This covers the fixed-revision policy only:
/// with `doNotUseFixedRevisionForChunks` off, hosts may derive ids from
/// revisions instead and pass them in as [`EntryLeaf::id`].
pub fn chunk_id(data: &str, encrypted: bool) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let prefix = if encrypted {
        PREFIX_ENCRYPTED_CHUNK
    } else {
        PREFIX_CHUNK
    };
    format!("{}{}", prefix, hex::encode(&digest[..16]))
}

/// Fingerprint of an encryption passphrase, comparable across nodes.
///
/// Salted SHA-256 prefix; the passphrase itself never leaves the node.
pub fn passphrase_fingerprint(passphrase: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"livesync-passphrase:");
    hasher.update(passphrase.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Check if a document id names a chunk.
pub fn is_chunk_id(id: &str) -> bool {
    id.starts_with(PREFIX_CHUNK)
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Content documents
// ═══════════════════════════════════════════════════════════════════════════════

/// A standalone, immutable chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryLeaf {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub data: String,
    #[serde(rename = "isCorrupted", default, skip_serializing_if = "Option::is_none")]
    pub is_corrupted: Option<bool>,
}

impl EntryLeaf {
    /// Create a leaf with a known id.
    pub fn new(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            data: data.into(),
            is_corrupted: None,
        }
    }

    /// Serialize with its `type` tag for a bulk write.
    pub fn to_document(&self) -> RawDocument {
        serde_json::to_value(EntryDoc::Leaf(self.clone())).unwrap_or(Value::Null)
    }
}

/// Inline content of a `notes` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InlineData {
    Text(String),
    Lines(Vec<String>),
}

impl InlineData {
    pub fn joined(&self) -> String {
        match self {
            InlineData::Text(s) => s.clone(),
            InlineData::Lines(lines) => lines.concat(),
        }
    }
}

/// A file whose content is stored inline (`type: "notes"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEntry {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub path: String,
    pub data: InlineData,
    pub ctime: i64,
    pub mtime: i64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default)]
    pub eden: EdenMap,
}

/// A file whose content is the concatenation of leaves
/// (`type: "newnote"` or `type: "plain"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildrenEntry {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub path: String,
    pub children: Vec<String>,
    pub ctime: i64,
    pub mtime: i64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default)]
    pub eden: EdenMap,
}

impl ChildrenEntry {
    /// Rebuild the entry's content from its children, in order.
    ///
    /// Each child is looked up in the embedded Eden map first, then in
    /// `leaves`. Returns `None` if any child is unavailable.
    pub fn reconstruct(&self, leaves: &HashMap<String, String>) -> Option<String> {
        let mut content = String::new();
        for child in &self.children {
            let piece = self
                .eden
                .get(child)
                .map(|c| c.data.as_str())
                .or_else(|| leaves.get(child).map(String::as_str))?;
            content.push_str(piece);
        }
        Some(content)
    }

    /// Children that are neither incubating nor present in `leaves`.
    pub fn missing_children<'a>(&'a self, leaves: &HashMap<String, String>) -> Vec<&'a str> {
        self.children
            .iter()
            .filter(|c| self.eden.get(c).is_none() && !leaves.contains_key(c.as_str()))
            .map(String::as_str)
            .collect()
    }
}

/// Content-bearing documents, tagged by their `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EntryDoc {
    #[serde(rename = "notes")]
    Note(NoteEntry),
    #[serde(rename = "newnote")]
    NewNote(ChildrenEntry),
    #[serde(rename = "plain")]
    Plain(ChildrenEntry),
    #[serde(rename = "leaf")]
    Leaf(EntryLeaf),
}

impl EntryDoc {
    /// Interpret a raw document, if it is a content document.
    pub fn from_document(doc: &RawDocument) -> Option<Self> {
        serde_json::from_value(doc.clone()).ok()
    }

    pub fn id(&self) -> &str {
        match self {
            EntryDoc::Note(e) => &e.id,
            EntryDoc::NewNote(e) | EntryDoc::Plain(e) => &e.id,
            EntryDoc::Leaf(l) => &l.id,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coordination documents
// ═══════════════════════════════════════════════════════════════════════════════

/// Range of chunk format versions a node can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkVersionRange {
    /// Lowest compatible chunk format version.
    pub min: u32,
    /// Highest compatible chunk format version.
    pub max: u32,
    /// Version this node writes.
    pub current: u32,
}

/// Remote protocol version record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub version: u32,
}

impl VersionInfo {
    pub fn new(version: u32) -> Self {
        Self {
            id: VERSIONING_DOCID.to_string(),
            rev: None,
            doc_type: "versioninfo".to_string(),
            version,
        }
    }
}

/// Local record of this replica's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub nodeid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v20220607: Option<bool>,
}

impl NodeInfo {
    /// A fresh node identity.
    pub fn generate() -> Self {
        Self {
            id: NODEINFO_DOCID.to_string(),
            rev: None,
            doc_type: "nodeinfo".to_string(),
            nodeid: uuid::Uuid::new_v4().simple().to_string(),
            v20220607: Some(true),
        }
    }
}

fn milestone_type() -> String {
    "milestoneinfo".to_string()
}

/// The shared coordination record.
///
/// Read-modify-written by every node. Fields this engine does not know are
/// carried through `extra` so a write never drops another node's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneInfo {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "type", default = "milestone_type")]
    pub doc_type: String,
    /// Creation time in milliseconds; also identifies the remote incarnation.
    pub created: i64,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaned: Option<bool>,
    #[serde(default)]
    pub accepted_nodes: Vec<String>,
    #[serde(default)]
    pub node_chunk_info: BTreeMap<String, ChunkVersionRange>,
    #[serde(default)]
    pub tweak_values: BTreeMap<String, TweakValues>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MilestoneInfo {
    /// The record a node writes when none exists yet.
    pub fn initial(node_id: &str, range: ChunkVersionRange) -> Self {
        let mut node_chunk_info = BTreeMap::new();
        node_chunk_info.insert(node_id.to_string(), range);
        Self {
            id: MILESTONE_DOCID.to_string(),
            rev: None,
            doc_type: milestone_type(),
            created: now_millis(),
            locked: false,
            cleaned: None,
            accepted_nodes: vec![node_id.to_string()],
            node_chunk_info,
            tweak_values: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn is_accepted(&self, node_id: &str) -> bool {
        self.accepted_nodes.iter().any(|n| n == node_id)
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.unwrap_or(false)
    }

    /// Add a node to `accepted_nodes` if absent. Returns true if changed.
    pub fn accept(&mut self, node_id: &str) -> bool {
        if self.is_accepted(node_id) {
            return false;
        }
        self.accepted_nodes.push(node_id.to_string());
        true
    }

    /// Merge chunk-version entries, keeping existing ones.
    ///
    /// Each node only ever contributes its own key, so merging updates from
    /// different nodes gives the same map in any order.
    pub fn merge_node_chunk_info(&mut self, incoming: &BTreeMap<String, ChunkVersionRange>) {
        for (node, range) in incoming {
            self.node_chunk_info.entry(node.clone()).or_insert(*range);
        }
    }

    /// Merge fingerprint entries, keeping existing ones.
    pub fn merge_tweak_values(&mut self, incoming: &BTreeMap<String, TweakValues>) {
        for (node, values) in incoming {
            self.tweak_values
                .entry(node.clone())
                .or_insert_with(|| values.clone());
        }
    }

    /// Set this node's chunk range, updating min/max if they moved.
    /// Returns true if changed.
    pub fn register_chunk_range(&mut self, node_id: &str, range: ChunkVersionRange) -> bool {
        match self.node_chunk_info.get_mut(node_id) {
            Some(existing) if existing.min == range.min && existing.max == range.max => false,
            Some(existing) => {
                existing.min = range.min;
                existing.max = range.max;
                true
            }
            None => {
                self.node_chunk_info.insert(node_id.to_string(), range);
                true
            }
        }
    }

    /// Record this node's fingerprint. Returns true if changed.
    pub fn register_tweak_values(&mut self, node_id: &str, values: &TweakValues) -> bool {
        if self.tweak_values.get(node_id) == Some(values) {
            return false;
        }
        self.tweak_values.insert(node_id.to_string(), values.clone());
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TweakValues: configuration fingerprint
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON keys of the fingerprint fields that must agree between nodes.
pub const SHOULD_MATCH_KEYS: &[&str] = &[
    "minimumChunkSize",
    "longLineThreshold",
    "encrypt",
    "usePathObfuscation",
    "enableCompression",
    "useEden",
    "customChunkSize",
    "useDynamicIterationCount",
    "hashAlg",
    "enableChunkSplitterV2",
    "maxChunksInEden",
    "maxTotalLengthInEden",
    "maxAgeInEden",
    "usePluginSyncV2",
    "handleFilenameCaseSensitive",
    "doNotUseFixedRevisionForChunks",
    "useSegmenter",
    "passphraseFingerprint",
];

/// JSON keys of the fingerprint fields that are recommended to agree.
pub const RECOMMENDED_KEYS: &[&str] = &[
    "batch_size",
    "batches_limit",
    "useTimeouts",
    "readChunksOnline",
    "hashCacheMaxCount",
    "hashCacheMaxAmount",
    "concurrencyOfReadChunksOnline",
    "minimumIntervalOfReadChunksOnline",
    "syncMaxSizeInMB",
];

/// Canonical snapshot of the settings that affect chunk identity or
/// encoding, as published on the milestone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TweakValues {
    // Should match
    pub minimum_chunk_size: u32,
    pub long_line_threshold: u32,
    pub encrypt: bool,
    pub use_path_obfuscation: bool,
    pub enable_compression: bool,
    pub use_eden: bool,
    pub custom_chunk_size: u32,
    pub use_dynamic_iteration_count: bool,
    pub hash_alg: String,
    #[serde(rename = "enableChunkSplitterV2")]
    pub enable_chunk_splitter_v2: bool,
    pub max_chunks_in_eden: u32,
    pub max_total_length_in_eden: u32,
    pub max_age_in_eden: u32,
    #[serde(rename = "usePluginSyncV2")]
    pub use_plugin_sync_v2: bool,
    pub handle_filename_case_sensitive: bool,
    pub do_not_use_fixed_revision_for_chunks: bool,
    pub use_segmenter: bool,
    /// Set only when `encrypt` is on.
    pub passphrase_fingerprint: Option<String>,

    // Recommended
    #[serde(rename = "batch_size")]
    pub batch_size: u32,
    #[serde(rename = "batches_limit")]
    pub batches_limit: u32,
    pub use_timeouts: bool,
    pub read_chunks_online: bool,
    pub hash_cache_max_count: u32,
    pub hash_cache_max_amount: u32,
    pub concurrency_of_read_chunks_online: u32,
    pub minimum_interval_of_read_chunks_online: u32,
    #[serde(rename = "syncMaxSizeInMB")]
    pub sync_max_size_in_mb: u32,

    /// Keys written by other versions.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for TweakValues {
    fn default() -> Self {
        Self {
            minimum_chunk_size: 20,
            long_line_threshold: 250,
            encrypt: false,
            use_path_obfuscation: false,
            enable_compression: false,
            use_eden: false,
            custom_chunk_size: 0,
            use_dynamic_iteration_count: false,
            hash_alg: "xxhash64".to_string(),
            enable_chunk_splitter_v2: true,
            max_chunks_in_eden: 10,
            max_total_length_in_eden: 1024,
            max_age_in_eden: 10,
            use_plugin_sync_v2: false,
            handle_filename_case_sensitive: false,
            do_not_use_fixed_revision_for_chunks: true,
            use_segmenter: false,
            passphrase_fingerprint: None,
            batch_size: 25,
            batches_limit: 25,
            use_timeouts: false,
            read_chunks_online: true,
            hash_cache_max_count: 300,
            hash_cache_max_amount: 50,
            concurrency_of_read_chunks_online: 40,
            minimum_interval_of_read_chunks_online: 50,
            sync_max_size_in_mb: 50,
            extra: BTreeMap::new(),
        }
    }
}

impl TweakValues {
    /// JSON object view used for key-wise comparison.
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Keys in `keys` whose values differ between `self` and `other`.
    pub fn differing_keys(&self, other: &TweakValues, keys: &[&'static str]) -> Vec<&'static str> {
        let mine = self.to_map();
        let theirs = other.to_map();
        keys.iter()
            .copied()
            .filter(|k| mine.get(*k) != theirs.get(*k))
            .collect()
    }

    /// Check if the must-agree part of the fingerprint differs.
    pub fn should_match_differs(&self, other: &TweakValues) -> bool {
        !self.differing_keys(other, SHOULD_MATCH_KEYS).is_empty()
    }
}
