// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Administrative operations on the remote.
//!
//! Milestone mutations are read-modify-write against a document other nodes
//! write too. A revision conflict re-reads and re-applies the change, with
//! backoff from [`ReplicatorConfig::milestone_retry`].
//!
//! [`ReplicatorConfig::milestone_retry`]: crate::config::ReplicatorConfig::milestone_retry

use super::LiveSyncReplicator;
use crate::config::RemoteDbSettings;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{
    ChunkVersionRange, EntryLeaf, MilestoneInfo, TweakValues, CURRENT_VERSION_RANGE, DEVICE_ID_PREFERRED,
    MILESTONE_DOCID, VER,
};
use crate::remote::{check_remote_version, connect_remote_with_setting};
use crate::resilience::retry_with_backoff;
use crate::store::{get_typed, put_typed, Database, DatabaseInfo, RemoteConnection, ReplicatorEnv};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Remote database info plus its on-disk size.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDbStatus {
    pub info: DatabaseInfo,
    pub estimated_size: u64,
}

fn is_conflict(e: &ReplicationError) -> bool {
    matches!(e, ReplicationError::Store { source, .. } if source.is_conflict())
}

/// Load the milestone (or `seed` when absent), apply `change`, write it.
async fn apply_milestone_change<F>(
    db: &dyn Database,
    seed: Option<&MilestoneInfo>,
    change: &F,
) -> Result<()>
where
    F: Fn(&mut MilestoneInfo) + Send + Sync,
{
    let loaded = get_typed::<MilestoneInfo>(db, MILESTONE_DOCID)
        .await
        .map_err(|e| ReplicationError::store("get milestone", e))?;
    let mut milestone = match (loaded, seed) {
        (Some(milestone), _) => milestone,
        (None, Some(seed)) => seed.clone(),
        (None, None) => return Err(ReplicationError::MilestoneMissing),
    };
    change(&mut milestone);
    put_typed(db, &milestone)
        .await
        .map_err(|e| ReplicationError::store("put milestone", e))?;
    Ok(())
}

impl<E: ReplicatorEnv> LiveSyncReplicator<E> {
    /// Connect with setup and fail unless the remote version is usable.
    async fn connect_checked(&self, settings: &RemoteDbSettings) -> Result<RemoteConnection> {
        let connection = connect_remote_with_setting(self.inner.env.as_ref(), settings, true, false).await?;
        if !check_remote_version(connection.db.as_ref(), VER).await? {
            warn!("Remote database is newer or corrupted, make sure to use the latest version");
            return Err(ReplicationError::Incompatible(
                "remote database is newer or corrupted".to_string(),
            ));
        }
        Ok(connection)
    }

    async fn update_milestone<F>(
        &self,
        db: &dyn Database,
        operation: &str,
        seed: Option<MilestoneInfo>,
        change: F,
    ) -> Result<()>
    where
        F: Fn(&mut MilestoneInfo) + Send + Sync,
    {
        let retry = self.inner.config.milestone_retry();
        retry_with_backoff(&retry, operation, is_conflict, || {
            apply_milestone_change(db, seed.as_ref(), &change)
        })
        .await
    }

    fn own_chunk_info(node_id: &str) -> BTreeMap<String, ChunkVersionRange> {
        BTreeMap::from([(node_id.to_string(), CURRENT_VERSION_RANGE)])
    }

    /// Lock (or unlock) the remote for every node but this one.
    ///
    /// `lock_by_clean` additionally marks the remote cleaned; the mark is
    /// never cleared by a later unlock.
    pub async fn mark_remote_locked(&self, settings: &RemoteDbSettings, locked: bool, lock_by_clean: bool) -> Result<()> {
        let connection = self.connect_checked(settings).await?;
        let node_id = self.node_id().await?;
        let seed = MilestoneInfo {
            locked,
            cleaned: Some(lock_by_clean),
            ..MilestoneInfo::initial(&node_id, CURRENT_VERSION_RANGE)
        };
        let own = Self::own_chunk_info(&node_id);
        self.update_milestone(connection.db.as_ref(), "mark remote locked", Some(seed), |m| {
            m.merge_node_chunk_info(&own);
            m.accepted_nodes = vec![node_id.clone()];
            m.locked = locked;
            m.cleaned = Some(m.is_cleaned() || lock_by_clean);
        })
        .await?;
        info!(locked, lock_by_clean, "Remote database lock updated");
        Ok(())
    }

    /// Accept this node on a locked remote.
    pub async fn mark_remote_resolved(&self, settings: &RemoteDbSettings) -> Result<()> {
        let connection = self.connect_checked(settings).await?;
        let node_id = self.node_id().await?;
        let seed = MilestoneInfo::initial(&node_id, CURRENT_VERSION_RANGE);
        let own = Self::own_chunk_info(&node_id);
        self.update_milestone(connection.db.as_ref(), "mark remote resolved", Some(seed), |m| {
            m.merge_node_chunk_info(&own);
            m.accept(&node_id);
        })
        .await?;
        info!("Remote database marked as resolved for this device");
        Ok(())
    }

    /// Forget every node's configuration fingerprint.
    pub async fn reset_remote_tweak_settings(&self, settings: &RemoteDbSettings) -> Result<()> {
        let connection = self.connect_checked(settings).await?;
        self.update_milestone(connection.db.as_ref(), "reset remote tweak settings", None, |m| {
            m.tweak_values.clear();
        })
        .await?;
        info!("Remote configuration fingerprints cleared");
        Ok(())
    }

    /// Publish this node's fingerprint as the preferred one.
    pub async fn set_preferred_remote_tweak_settings(&self, settings: &RemoteDbSettings) -> Result<()> {
        let connection = self.connect_checked(settings).await?;
        let preferred = settings.tweak_values();
        self.update_milestone(
            connection.db.as_ref(),
            "set preferred remote tweak settings",
            None,
            |m| {
                m.tweak_values
                    .insert(DEVICE_ID_PREFERRED.to_string(), preferred.clone());
            },
        )
        .await?;
        info!("Preferred configuration fingerprint published");
        Ok(())
    }

    /// The preferred fingerprint on the remote, if any.
    pub async fn get_remote_preferred_tweak_values(&self, settings: &RemoteDbSettings) -> Result<Option<TweakValues>> {
        let connection = self.connect_checked(settings).await?;
        let milestone = get_typed::<MilestoneInfo>(connection.db.as_ref(), MILESTONE_DOCID)
            .await
            .map_err(|e| ReplicationError::store("get milestone", e))?;
        Ok(milestone.and_then(|mut m| m.tweak_values.remove(DEVICE_ID_PREFERRED)))
    }

    /// Fetch chunks that were left on the remote.
    ///
    /// Uses the host's current settings. Fails with
    /// [`ReplicationError::MissingChunks`] if any id is absent. Calls are
    /// spaced by the settings' minimum fetch interval.
    pub async fn fetch_remote_chunks(&self, ids: &[String], show_result: bool) -> Result<Vec<EntryLeaf>> {
        let settings = self.inner.env.settings();
        self.chunk_limiter(settings.read_chunks_interval()).acquire().await;

        let connection = connect_remote_with_setting(self.inner.env.as_ref(), &settings, false, true).await?;
        let rows = match connection.db.all_docs(ids.to_vec(), true).await {
            Ok(rows) => rows,
            Err(e) => {
                metrics::record_chunk_fetch(ids.len(), false);
                return Err(ReplicationError::store("fetch chunks", e));
            }
        };

        let missing: Vec<String> = rows.iter().filter(|r| r.is_error()).map(|r| r.key.clone()).collect();
        if !missing.is_empty() {
            metrics::record_chunk_fetch(ids.len(), false);
            notice!(show_result, missing = missing.len(), "Could not retrieve chunks");
            return Err(ReplicationError::MissingChunks(missing));
        }

        let leaves = rows
            .into_iter()
            .filter_map(|row| row.doc)
            .map(|doc| {
                serde_json::from_value::<EntryLeaf>(doc)
                    .map_err(|e| ReplicationError::Internal(format!("malformed chunk: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;
        metrics::record_chunk_fetch(ids.len(), true);
        debug!(count = leaves.len(), "Chunks fetched");
        Ok(leaves)
    }

    /// Ask the remote to compact itself.
    pub async fn compact_remote(&self, settings: &RemoteDbSettings) -> Result<bool> {
        let connection = self.connect_checked(settings).await?;
        let compacted = connection
            .db
            .compact()
            .await
            .map_err(|e| ReplicationError::store("compact", e))?;
        info!(compacted, "Remote compaction requested");
        Ok(compacted)
    }

    pub async fn get_remote_status(&self, settings: &RemoteDbSettings) -> Result<RemoteDbStatus> {
        let connection = self.connect_checked(settings).await?;
        let info = connection
            .db
            .info()
            .await
            .map_err(|e| ReplicationError::store("remote info", e))?;
        let estimated_size = info.sizes.file;
        Ok(RemoteDbStatus { info, estimated_size })
    }

    /// Connect and report the database name.
    pub async fn try_connect_remote(&self, settings: &RemoteDbSettings, show_result: bool) -> Result<DatabaseInfo> {
        match connect_remote_with_setting(self.inner.env.as_ref(), settings, false, false).await {
            Ok(connection) => {
                notice!(show_result, "Connected to {}", connection.info.db_name);
                Ok(connection.info)
            }
            Err(e) => {
                notice!(show_result, error = %e, "Could not connect to remote database");
                Err(e)
            }
        }
    }

    /// Close replication and create the remote database if needed.
    pub async fn try_create_remote_database(&self, settings: &RemoteDbSettings) -> Result<()> {
        self.close_replication();
        connect_remote_with_setting(self.inner.env.as_ref(), settings, true, false).await?;
        info!("Remote Database Created or Connected");
        Ok(())
    }

    /// Close replication, destroy the remote database, and create it anew.
    pub async fn try_reset_remote_database(&self, settings: &RemoteDbSettings) -> Result<()> {
        self.close_replication();
        let connection = connect_remote_with_setting(self.inner.env.as_ref(), settings, true, true).await?;
        connection
            .db
            .destroy()
            .await
            .map_err(|e| ReplicationError::store("destroy", e))?;
        info!("Remote Database Destroyed");
        self.try_create_remote_database(settings).await
    }
}
