// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication session manager.
//!
//! The main orchestrator that ties together:
//! - Connectivity and compatibility checks via [`crate::remote`] and [`crate::compat`]
//! - Event consumption via [`crate::stream::ReplicationEventStream`]
//! - Admission control via [`crate::resilience::PacingController`]
//! - Administrative operations on the shared milestone
//!
//! # Architecture
//!
//! A replicator owns at most one session. Each session attempt is run by the
//! calling task from start to finish: it claims the session slot, checks
//! connectivity, opens the replication through the host's
//! [`LocalDatabase`](crate::store::LocalDatabase), and consumes events until
//! the attempt resolves. Counters are only mutated on that task and
//! published through a watch channel.
//!
//! ```text
//!  open_one_shot_replication ─┐                      ┌─► DONE ──────► Ok(true)
//!                             ├─► attempt ─► outcome ├─► CANCELLED ─► Ok(false)
//!  open_continuous_replication┘      ▲               ├─► FAILED ────► Err(..)
//!                                    │               ├─► NEED_RETRY ─► shrink batches
//!                                    └───────────────┴─► NEED_RESURRECT ─► original settings
//! ```

mod admin;
mod send_chunks;
mod session;
mod types;

pub use admin::RemoteDbStatus;
pub use send_chunks::{plan_batches, SEND_CHUNKS_TOPIC};
pub use types::{
    next_retry_batches, shrink_batch, AttemptOutcome, ReplicationStat, SyncStatus, MIN_RETRY_BATCH,
};

use crate::coalesce::RunningResults;
use crate::compat::{build_sync_options, ensure_database_is_compatible, Compatibility};
use crate::config::{RemoteDbSettings, ReplicatorConfig};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{TweakValues, CURRENT_VERSION_RANGE, VER};
use crate::remote::{check_remote_version, connect_remote_with_setting, ensure_node_id};
use crate::resilience::{PacingController, RateLimiter};
use crate::store::{RemoteConnection, ReplicatorEnv, SyncOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Flags describing why the last connectivity check blocked.
///
/// Reset at the start of every full (non-skipped) check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteFlags {
    pub remote_locked: bool,
    pub remote_cleaned: bool,
    pub remote_locked_and_device_not_accepted: bool,
    pub tweak_settings_mismatched: bool,
    /// Remote fingerprint that differed from ours.
    pub preferred_tweak_value: Option<TweakValues>,
}

/// A remote that passed the connectivity check, with the options to
/// replicate against it.
#[derive(Debug, Clone)]
pub struct ConnectivityResult {
    pub connection: RemoteConnection,
    pub base_options: SyncOptions,
    pub options: SyncOptions,
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
}

type SessionSlot = Arc<Mutex<Option<ActiveSession>>>;

/// Held by the task running a session attempt. Frees the slot on drop
/// unless the session was already closed or replaced.
struct SessionGuard {
    slot: SessionSlot,
    id: u64,
    cancel: CancellationToken,
}

impl SessionGuard {
    fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if slot.as_ref().is_some_and(|s| s.id == self.id) {
            *slot = None;
        }
    }
}

struct Inner<E: ReplicatorEnv> {
    env: Arc<E>,
    config: ReplicatorConfig,
    pacing: Arc<PacingController>,
    stat_tx: watch::Sender<ReplicationStat>,
    session: SessionSlot,
    next_session_id: AtomicU64,
    /// Settings of the last non-retry attempt, restored on resurrection.
    original_setting: Mutex<Option<RemoteDbSettings>>,
    node_id: RwLock<Option<String>>,
    flags: Mutex<RemoteFlags>,
    running: RunningResults<Result<bool>>,
    chunk_limiter: Mutex<Option<Arc<RateLimiter>>>,
}

/// The replicator.
///
/// Cheap to clone; clones share one session slot and one set of counters.
pub struct LiveSyncReplicator<E: ReplicatorEnv> {
    inner: Arc<Inner<E>>,
}

impl<E: ReplicatorEnv> Clone for LiveSyncReplicator<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: ReplicatorEnv> LiveSyncReplicator<E> {
    /// Create a replicator for `env`.
    ///
    /// Uses the process-wide pacing controller unless `config` asks for a
    /// private one.
    pub fn new(env: Arc<E>, config: ReplicatorConfig) -> Self {
        let pacing = match config.pacing_permits {
            Some(permits) => Arc::new(PacingController::new(permits)),
            None => PacingController::global(),
        };
        Self::with_pacing(env, config, pacing)
    }

    /// Create a replicator sharing `pacing` with other work.
    pub fn with_pacing(env: Arc<E>, config: ReplicatorConfig, pacing: Arc<PacingController>) -> Self {
        let (stat_tx, _) = watch::channel(ReplicationStat::default());
        Self {
            inner: Arc::new(Inner {
                env,
                config,
                pacing,
                stat_tx,
                session: Arc::new(Mutex::new(None)),
                next_session_id: AtomicU64::new(1),
                original_setting: Mutex::new(None),
                node_id: RwLock::new(None),
                flags: Mutex::new(RemoteFlags::default()),
                running: RunningResults::new(),
                chunk_limiter: Mutex::new(None),
            }),
        }
    }

    pub fn env(&self) -> &Arc<E> {
        &self.inner.env
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.inner.config
    }

    /// Snapshot of the session counters.
    pub fn stat(&self) -> ReplicationStat {
        self.inner.stat_tx.borrow().clone()
    }

    /// Watch the session counters.
    pub fn subscribe(&self) -> watch::Receiver<ReplicationStat> {
        self.inner.stat_tx.subscribe()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.stat_tx.borrow().sync_status
    }

    pub fn flags(&self) -> RemoteFlags {
        lock(&self.inner.flags).clone()
    }

    /// Check if a session currently holds the slot.
    pub fn is_session_active(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    /// This replica's node id, read or created on first use.
    pub async fn node_id(&self) -> Result<String> {
        if let Some(id) = self.inner.node_id.read().await.as_ref() {
            return Ok(id.clone());
        }
        let mut slot = self.inner.node_id.write().await;
        if let Some(id) = slot.as_ref() {
            return Ok(id.clone());
        }
        let local = self.inner.env.local_database();
        let id = ensure_node_id(local.as_ref()).await?;
        *slot = Some(id.clone());
        Ok(id)
    }

    fn update_stat(&self, apply: impl FnOnce(&mut ReplicationStat)) {
        self.inner.stat_tx.send_modify(apply);
    }

    fn set_status(&self, status: SyncStatus) {
        self.update_stat(|s| s.sync_status = status);
        metrics::record_sync_status(status);
    }

    fn claim_session(&self) -> Result<SessionGuard> {
        let mut slot = lock(&self.inner.session);
        if slot.is_some() {
            return Err(ReplicationError::AlreadyRunning);
        }
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        *slot = Some(ActiveSession {
            id,
            cancel: cancel.clone(),
        });
        Ok(SessionGuard {
            slot: Arc::clone(&self.inner.session),
            id,
            cancel,
        })
    }

    /// Stop the current session and mark it CLOSED. No-op without a session.
    pub fn close_replication(&self) {
        let Some(session) = lock(&self.inner.session).take() else {
            return;
        };
        session.cancel.cancel();
        self.set_status(SyncStatus::Closed);
        debug!(session = session.id, "Replication closed");
    }

    /// Stop the current session without touching its status.
    pub fn terminate_sync(&self) {
        if let Some(session) = lock(&self.inner.session).take() {
            session.cancel.cancel();
            debug!(session = session.id, "Replication terminated");
        }
    }

    fn original_batch_size(&self, settings: &RemoteDbSettings) -> u32 {
        lock(&self.inner.original_setting)
            .as_ref()
            .map_or(settings.batch_size, |s| s.batch_size)
    }

    /// Chunk-fetch limiter for `period`, rebuilt when the interval changes.
    fn chunk_limiter(&self, period: Duration) -> Arc<RateLimiter> {
        let mut slot = lock(&self.inner.chunk_limiter);
        match slot.as_ref() {
            Some(limiter) if limiter.period() == period => Arc::clone(limiter),
            _ => {
                let limiter = Arc::new(RateLimiter::every(period));
                *slot = Some(Arc::clone(&limiter));
                limiter
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Connectivity
    // ═══════════════════════════════════════════════════════════════════════════

    /// Connect to the remote and decide whether this node may replicate.
    ///
    /// Refuses while a session is active. With `skip_check`, only connects
    /// (no version or milestone check, flags untouched).
    pub async fn check_replication_connectivity(
        &self,
        settings: &RemoteDbSettings,
        keep_alive: bool,
        skip_check: bool,
        show_result: bool,
        ignore_clean_lock: bool,
    ) -> Result<ConnectivityResult> {
        if self.is_session_active() {
            notice!(show_result, "Another replication running.");
            return Err(ReplicationError::AlreadyRunning);
        }
        self.check_connectivity(settings, keep_alive, skip_check, show_result, ignore_clean_lock)
            .await
    }

    async fn check_connectivity(
        &self,
        settings: &RemoteDbSettings,
        keep_alive: bool,
        skip_check: bool,
        show_result: bool,
        ignore_clean_lock: bool,
    ) -> Result<ConnectivityResult> {
        if !settings.version_up_flash.is_empty() {
            warn!("Open settings and check message, please. Replication is paused until acknowledged.");
            return Err(ReplicationError::PendingNotice(settings.version_up_flash.clone()));
        }
        if !skip_check {
            *lock(&self.inner.flags) = RemoteFlags::default();
        }

        let connection = match connect_remote_with_setting(self.inner.env.as_ref(), settings, true, false).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "Could not connect to remote database");
                return Err(e);
            }
        };

        if !skip_check {
            if !check_remote_version(connection.db.as_ref(), VER).await? {
                warn!("Remote database is newer or corrupted, make sure to use the latest version");
                return Err(ReplicationError::Incompatible(
                    "remote database is newer or corrupted".to_string(),
                ));
            }
            let node_id = self.node_id().await?;
            let verdict =
                ensure_database_is_compatible(connection.db.as_ref(), settings, &node_id, CURRENT_VERSION_RANGE)
                    .await?;
            self.apply_verdict(verdict, show_result, ignore_clean_lock)?;
        }

        let (base_options, options) =
            build_sync_options(settings, keep_alive, self.inner.config.heartbeat_duration());
        Ok(ConnectivityResult {
            connection,
            base_options,
            options,
        })
    }

    fn apply_verdict(&self, verdict: Compatibility, show_result: bool, ignore_clean_lock: bool) -> Result<()> {
        let mut flags = lock(&self.inner.flags);
        match verdict {
            Compatibility::Ok => Ok(()),
            Compatibility::Locked => {
                flags.remote_locked = true;
                notice!(show_result, "Remote database is locked, but this device is accepted");
                Ok(())
            }
            Compatibility::NodeCleaned if ignore_clean_lock => {
                flags.remote_locked = true;
                notice!(show_result, "Remote database has been cleaned up; continuing as requested");
                Ok(())
            }
            Compatibility::NodeLocked => {
                flags.remote_locked = true;
                flags.remote_locked_and_device_not_accepted = true;
                warn!("Remote database has been rebuilt. Fetch from it or unlock it to continue");
                Err(ReplicationError::NodeLocked)
            }
            Compatibility::NodeCleaned => {
                flags.remote_locked = true;
                flags.remote_cleaned = true;
                flags.remote_locked_and_device_not_accepted = true;
                warn!("Remote database has been cleaned up. Fetch from it or unlock it to continue");
                Err(ReplicationError::NodeCleaned)
            }
            Compatibility::Mismatched(remote) => {
                flags.tweak_settings_mismatched = true;
                flags.preferred_tweak_value = Some((*remote).clone());
                warn!("Configuration mismatch between this device and the remote database");
                Err(ReplicationError::Mismatched { remote })
            }
            Compatibility::Incompatible(reason) => {
                warn!(%reason, "Remote database is incompatible with this version");
                Err(ReplicationError::Incompatible(reason))
            }
        }
    }
}

impl<E: ReplicatorEnv> std::fmt::Debug for LiveSyncReplicator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSyncReplicator")
            .field("stat", &self.stat())
            .field("session_active", &self.is_session_active())
            .finish_non_exhaustive()
    }
}
