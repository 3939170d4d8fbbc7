// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replicator.
//!
//! Two layers:
//!
//! - [`RemoteDbSettings`]: everything that describes one remote database and
//!   how content is shaped for it. This is what the host's settings screen
//!   edits and what gets passed to every session and admin operation.
//! - [`ReplicatorConfig`]: engine knobs that are not part of the shared
//!   settings (busy timeout, heartbeat, pacing, milestone write retries).
//!
//! # Quick Start
//!
//! ```rust
//! use livesync_replicator::config::{RemoteDbSettings, ReplicatorConfig};
//!
//! let settings = RemoteDbSettings {
//!     couchdb_dbname: "vault".into(),
//!     ..RemoteDbSettings::for_testing("http://localhost:5984")
//! };
//! assert_eq!(settings.remote_uri(), "http://localhost:5984/vault");
//!
//! let config = ReplicatorConfig::default();
//! assert_eq!(config.busy_timeout_duration().as_millis(), 3_000_000);
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "couchdb_uri": "https://couch.example.com",
//!   "couchdb_user": "alice",
//!   "couchdb_password": "secret",
//!   "couchdb_dbname": "vault",
//!   "encrypt": true,
//!   "passphrase": "correct horse",
//!   "batch_size": 50,
//!   "read_chunks_online": true
//! }
//! ```
//!
//! Every field has a default, so a partial document is accepted.

use crate::eden::EdenConfig;
use crate::model::{passphrase_fingerprint, TweakValues};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// RemoteDbSettings: one flat record per remote
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for one remote database.
///
/// Kept flat: the host persists it as a single object and the fingerprint
/// ([`TweakValues`]) is extracted from it field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDbSettings {
    // ─────────────────────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────────────────────
    /// Server URI, without the database name.
    #[serde(default)]
    pub couchdb_uri: String,

    #[serde(default)]
    pub couchdb_user: String,

    #[serde(default)]
    pub couchdb_password: String,

    /// Database name. Empty means `couchdb_uri` already names the database.
    #[serde(default)]
    pub couchdb_dbname: String,

    /// End-to-end encryption passphrase.
    #[serde(default)]
    pub passphrase: String,

    #[serde(default)]
    pub encrypt: bool,

    /// Allow `encrypt` with an empty passphrase.
    #[serde(default)]
    pub permit_empty_passphrase: bool,

    #[serde(default)]
    pub use_path_obfuscation: bool,

    #[serde(default)]
    pub use_dynamic_iteration_count: bool,

    #[serde(default)]
    pub enable_compression: bool,

    /// Avoid request URIs that embed credentials (always on for mobile hosts).
    #[serde(default)]
    pub disable_request_uri: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Transfer tuning
    // ─────────────────────────────────────────────────────────────────────────
    /// Documents per replication batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Batches buffered in flight.
    #[serde(default = "default_batches_limit")]
    pub batches_limit: u32,

    /// Disable the live heartbeat and rely on request timeouts instead.
    #[serde(default)]
    pub use_timeouts: bool,

    /// Skip chunks during pull and fetch them on demand.
    #[serde(default = "default_true")]
    pub read_chunks_online: bool,

    #[serde(default = "default_concurrency_of_read_chunks_online")]
    pub concurrency_of_read_chunks_online: u32,

    /// Minimum interval between on-demand chunk fetches (ms).
    #[serde(default = "default_minimum_interval_of_read_chunks_online")]
    pub minimum_interval_of_read_chunks_online: u32,

    /// Size cap of one bulk chunk upload (MB).
    #[serde(default = "default_send_chunks_bulk_max_size")]
    pub send_chunks_bulk_max_size: u32,

    #[serde(default = "default_sync_max_size_in_mb")]
    pub sync_max_size_in_mb: u32,

    #[serde(default = "default_hash_cache_max_count")]
    pub hash_cache_max_count: u32,

    #[serde(default = "default_hash_cache_max_amount")]
    pub hash_cache_max_amount: u32,

    /// Unacknowledged version-up notice. Non-empty blocks replication.
    #[serde(default)]
    pub version_up_flash: String,

    /// Accept remotes whose chunk-version ranges do not intersect.
    #[serde(default)]
    pub ignore_version_check: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Content identity
    // ─────────────────────────────────────────────────────────────────────────
    #[serde(default = "default_minimum_chunk_size")]
    pub minimum_chunk_size: u32,

    #[serde(default = "default_long_line_threshold")]
    pub long_line_threshold: u32,

    #[serde(default)]
    pub custom_chunk_size: u32,

    #[serde(default = "default_hash_alg")]
    pub hash_alg: String,

    #[serde(default = "default_true")]
    pub enable_chunk_splitter_v2: bool,

    #[serde(default)]
    pub use_segmenter: bool,

    #[serde(default)]
    pub use_eden: bool,

    #[serde(default = "default_max_chunks_in_eden")]
    pub max_chunks_in_eden: u32,

    #[serde(default = "default_max_total_length_in_eden")]
    pub max_total_length_in_eden: u32,

    #[serde(default = "default_max_age_in_eden")]
    pub max_age_in_eden: u32,

    #[serde(default)]
    pub use_plugin_sync_v2: bool,

    #[serde(default)]
    pub handle_filename_case_sensitive: bool,

    #[serde(default = "default_true")]
    pub do_not_use_fixed_revision_for_chunks: bool,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> u32 {
    25
}

fn default_batches_limit() -> u32 {
    25
}

fn default_concurrency_of_read_chunks_online() -> u32 {
    40
}

fn default_minimum_interval_of_read_chunks_online() -> u32 {
    50
}

fn default_send_chunks_bulk_max_size() -> u32 {
    1
}

fn default_sync_max_size_in_mb() -> u32 {
    50
}

fn default_hash_cache_max_count() -> u32 {
    300
}

fn default_hash_cache_max_amount() -> u32 {
    50
}

fn default_minimum_chunk_size() -> u32 {
    20
}

fn default_long_line_threshold() -> u32 {
    250
}

fn default_hash_alg() -> String {
    "xxhash64".to_string()
}

fn default_max_chunks_in_eden() -> u32 {
    10
}

fn default_max_total_length_in_eden() -> u32 {
    1024
}

fn default_max_age_in_eden() -> u32 {
    10
}

impl Default for RemoteDbSettings {
    fn default() -> Self {
        Self {
            couchdb_uri: String::new(),
            couchdb_user: String::new(),
            couchdb_password: String::new(),
            couchdb_dbname: String::new(),
            passphrase: String::new(),
            encrypt: false,
            permit_empty_passphrase: false,
            use_path_obfuscation: false,
            use_dynamic_iteration_count: false,
            enable_compression: false,
            disable_request_uri: false,
            batch_size: default_batch_size(),
            batches_limit: default_batches_limit(),
            use_timeouts: false,
            read_chunks_online: true,
            concurrency_of_read_chunks_online: default_concurrency_of_read_chunks_online(),
            minimum_interval_of_read_chunks_online: default_minimum_interval_of_read_chunks_online(),
            send_chunks_bulk_max_size: default_send_chunks_bulk_max_size(),
            sync_max_size_in_mb: default_sync_max_size_in_mb(),
            hash_cache_max_count: default_hash_cache_max_count(),
            hash_cache_max_amount: default_hash_cache_max_amount(),
            version_up_flash: String::new(),
            ignore_version_check: false,
            minimum_chunk_size: default_minimum_chunk_size(),
            long_line_threshold: default_long_line_threshold(),
            custom_chunk_size: 0,
            hash_alg: default_hash_alg(),
            enable_chunk_splitter_v2: true,
            use_segmenter: false,
            use_eden: false,
            max_chunks_in_eden: default_max_chunks_in_eden(),
            max_total_length_in_eden: default_max_total_length_in_eden(),
            max_age_in_eden: default_max_age_in_eden(),
            use_plugin_sync_v2: false,
            handle_filename_case_sensitive: false,
            do_not_use_fixed_revision_for_chunks: true,
        }
    }
}

impl RemoteDbSettings {
    /// Create settings for testing against `uri`.
    pub fn for_testing(uri: &str) -> Self {
        Self {
            couchdb_uri: uri.to_string(),
            couchdb_user: "test".to_string(),
            couchdb_password: "test".to_string(),
            ..Default::default()
        }
    }

    /// Full database URI: server URI plus `/dbname` when a name is set.
    pub fn remote_uri(&self) -> String {
        if self.couchdb_dbname.is_empty() {
            self.couchdb_uri.clone()
        } else {
            format!("{}/{}", self.couchdb_uri, self.couchdb_dbname)
        }
    }

    /// Extract the configuration fingerprint.
    pub fn tweak_values(&self) -> TweakValues {
        TweakValues {
            minimum_chunk_size: self.minimum_chunk_size,
            long_line_threshold: self.long_line_threshold,
            encrypt: self.encrypt,
            use_path_obfuscation: self.use_path_obfuscation,
            enable_compression: self.enable_compression,
            use_eden: self.use_eden,
            custom_chunk_size: self.custom_chunk_size,
            use_dynamic_iteration_count: self.use_dynamic_iteration_count,
            hash_alg: self.hash_alg.clone(),
            enable_chunk_splitter_v2: self.enable_chunk_splitter_v2,
            max_chunks_in_eden: self.max_chunks_in_eden,
            max_total_length_in_eden: self.max_total_length_in_eden,
            max_age_in_eden: self.max_age_in_eden,
            use_plugin_sync_v2: self.use_plugin_sync_v2,
            handle_filename_case_sensitive: self.handle_filename_case_sensitive,
            do_not_use_fixed_revision_for_chunks: self.do_not_use_fixed_revision_for_chunks,
            use_segmenter: self.use_segmenter,
            passphrase_fingerprint: self.encrypt.then(|| passphrase_fingerprint(&self.passphrase)),
            batch_size: self.batch_size,
            batches_limit: self.batches_limit,
            use_timeouts: self.use_timeouts,
            read_chunks_online: self.read_chunks_online,
            hash_cache_max_count: self.hash_cache_max_count,
            hash_cache_max_amount: self.hash_cache_max_amount,
            concurrency_of_read_chunks_online: self.concurrency_of_read_chunks_online,
            minimum_interval_of_read_chunks_online: self.minimum_interval_of_read_chunks_online,
            sync_max_size_in_mb: self.sync_max_size_in_mb,
            extra: BTreeMap::new(),
        }
    }

    /// Eden bounds for entry writes.
    pub fn eden_config(&self) -> EdenConfig {
        EdenConfig {
            enabled: self.use_eden,
            max_chunks: self.max_chunks_in_eden as usize,
            max_total_length: self.max_total_length_in_eden as usize,
            max_age: u64::from(self.max_age_in_eden),
        }
    }

    /// Byte cap of one bulk chunk upload.
    pub fn send_chunks_bulk_max_bytes(&self) -> usize {
        self.send_chunks_bulk_max_size as usize * 1024 * 1024
    }

    /// Interval between on-demand chunk fetches.
    pub fn read_chunks_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.minimum_interval_of_read_chunks_online))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicatorConfig: engine knobs
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine-level configuration, passed to
/// [`LiveSyncReplicator::new()`](crate::LiveSyncReplicator::new).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// How long a session event may wait for a pacing permit
    /// before the session gives up as busy.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: String,

    /// Live-mode heartbeat, used unless the settings ask for timeouts.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: String,

    /// Permits of a private pacing controller.
    /// `None` shares the process-wide controller.
    #[serde(default)]
    pub pacing_permits: Option<usize>,

    /// Attempts for a milestone write that hits a revision conflict.
    #[serde(default = "default_milestone_write_attempts")]
    pub milestone_write_attempts: usize,

    /// First backoff delay between milestone write attempts.
    #[serde(default = "default_milestone_write_backoff")]
    pub milestone_write_backoff: String,
}

fn default_busy_timeout() -> String {
    "50m".to_string()
}

fn default_heartbeat() -> String {
    "30s".to_string()
}

fn default_milestone_write_attempts() -> usize {
    5
}

fn default_milestone_write_backoff() -> String {
    "100ms".to_string()
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            busy_timeout: default_busy_timeout(),
            heartbeat: default_heartbeat(),
            pacing_permits: None,
            milestone_write_attempts: default_milestone_write_attempts(),
            milestone_write_backoff: default_milestone_write_backoff(),
        }
    }
}

impl ReplicatorConfig {
    /// Fast config for tests: private pacing, short busy timeout.
    pub fn for_testing() -> Self {
        Self {
            busy_timeout: "200ms".to_string(),
            heartbeat: "30s".to_string(),
            pacing_permits: Some(crate::resilience::GLOBAL_PACING_PERMITS),
            milestone_write_attempts: 3,
            milestone_write_backoff: "1ms".to_string(),
        }
    }

    pub fn busy_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.busy_timeout).unwrap_or(Duration::from_millis(3_000_000))
    }

    pub fn heartbeat_duration(&self) -> Duration {
        humantime::parse_duration(&self.heartbeat).unwrap_or(Duration::from_secs(30))
    }

    /// Backoff policy for milestone read-modify-write conflicts.
    pub fn milestone_retry(&self) -> RetryConfig {
        let initial_delay = humantime::parse_duration(&self.milestone_write_backoff)
            .unwrap_or(Duration::from_millis(100));
        RetryConfig {
            max_attempts: self.milestone_write_attempts.max(1),
            initial_delay,
            ..RetryConfig::milestone()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
