//! # LiveSync Replicator
//!
//! A replication engine for vaults stored as content-addressed chunks in a
//! CouchDB-style database, shared by many devices ("nodes").
//!
//! ## Architecture
//!
//! The replicator sits between the host (file system, editor, settings) and
//! the remote database. It never speaks HTTP itself; the host supplies the
//! stores and the replication primitive through [`store::ReplicatorEnv`]:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         livesync-replicator                          │
//! │                                                                      │
//! │  ┌────────────────────┐   ┌────────────────────┐   ┌──────────────┐  │
//! │  │ LiveSyncReplicator │──►│ compat             │──►│ LocalDatabase│  │
//! │  │ (session slot,     │   │ (milestone lock,   │   │ .replicate() │  │
//! │  │  retry, pacing)    │   │  fingerprints)     │   └──────┬───────┘  │
//! │  └─────────▲──────────┘   └────────────────────┘          │ events   │
//! │            │                                              ▼          │
//! │            │              ┌────────────────────┐   ┌──────────────┐  │
//! │            └──────────────│ process_sync       │◄──│ event stream │  │
//! │                           │ (counters, seqs)   │   │ (mailbox)    │  │
//! │                           └────────────────────┘   └──────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Coordination Without Talking
//!
//! Nodes coordinate only through the milestone document on the remote: lock
//! state, accepted nodes, chunk-format ranges, and configuration
//! fingerprints. See [`compat`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livesync_replicator::{LiveSyncReplicator, ReplicatorConfig};
//! use std::sync::Arc;
//!
//! let replicator = LiveSyncReplicator::new(Arc::new(host_env), ReplicatorConfig::default());
//! let settings = host_env.settings();
//!
//! // Catch up once, then stay live until closed.
//! replicator.open_replication(&settings, true, true, false).await?;
//! replicator.close_replication();
//! ```

/// Log a user-facing message: `info!` when the caller asked to see results,
/// `debug!` otherwise.
macro_rules! notice {
    ($show:expr, $($arg:tt)+) => {
        if $show {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

pub mod chunk_seq;
pub mod coalesce;
pub mod compat;
pub mod config;
pub mod eden;
pub mod error;
pub mod metrics;
pub mod model;
pub mod remote;
pub mod replicator;
pub mod resilience;
pub mod store;
pub mod stream;

// Re-exports for convenience
pub use compat::{Compatibility, TweakDifference};
pub use config::{RemoteDbSettings, ReplicatorConfig};
pub use eden::{save_entry, EdenConfig, EdenMap};
pub use error::{ReplicationError, Result, StoreError, StoreResult};
pub use model::{EntryLeaf, MilestoneInfo, TweakValues};
pub use replicator::{ConnectivityResult, LiveSyncReplicator, RemoteDbStatus, RemoteFlags, ReplicationStat, SyncStatus};
pub use resilience::PacingController;
pub use store::{Database, LocalDatabase, ReplicatorEnv, SyncMode, TaskQueue};
pub use stream::{EventSink, ReplicationEvent, ReplicationEventStream};
