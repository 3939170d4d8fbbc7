// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Compatibility and locking protocol.
//!
//! Nodes never talk to each other directly; they coordinate through the
//! milestone document on the remote. Before any transfer a node loads the
//! milestone, records itself in it, and evaluates whether it may proceed:
//!
//! ```text
//!  load / init milestone
//!          │
//!          ▼
//!  merge own chunk range ──► ranges of accepted nodes disjoint? ──► Incompatible
//!          │
//!          ▼
//!  locked? ──┬── not accepted ──► NodeLocked
//!            └── accepted ──────► Locked
//!          │
//!          ▼
//!  cleaned and not accepted? ───► NodeCleaned
//!          │
//!          ▼
//!  register (accepted_nodes, tweak_values[node])
//!          │
//!          ▼
//!  fingerprint differs from PREFERRED or another node? ──► Mismatched(remote)
//!          │
//!          ▼
//!         Ok
//! ```
//!
//! [`evaluate`] is the pure decision; [`ensure_database_is_compatible`] wraps
//! it with the remote read and the best-effort write.

use crate::config::RemoteDbSettings;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{
    ChunkVersionRange, MilestoneInfo, TweakValues, DEVICE_ID_PREFERRED, MILESTONE_DOCID,
    SHOULD_MATCH_KEYS,
};
use crate::store::{get_typed, put_typed, Database, SyncOptions};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Verdict of a compatibility check.
#[derive(Debug, Clone, PartialEq)]
pub enum Compatibility {
    Ok,
    /// Locked, but this node is accepted.
    Locked,
    NodeLocked,
    NodeCleaned,
    Incompatible(String),
    /// The first remote fingerprint that differed.
    Mismatched(Box<TweakValues>),
}

impl Compatibility {
    pub fn label(&self) -> &'static str {
        match self {
            Compatibility::Ok => "ok",
            Compatibility::Locked => "locked",
            Compatibility::NodeLocked => "node_locked",
            Compatibility::NodeCleaned => "node_cleaned",
            Compatibility::Incompatible(_) => "incompatible",
            Compatibility::Mismatched(_) => "mismatched",
        }
    }
}

/// Intersection of the chunk-version ranges of `nodes`.
///
/// Nodes without a recorded range are ignored. `None` when the ranges are
/// disjoint.
pub fn chunk_version_intersection<'a>(
    milestone: &MilestoneInfo,
    nodes: impl IntoIterator<Item = &'a str>,
) -> Option<(u32, u32)> {
    let mut low = 0u32;
    let mut high = u32::MAX;
    for node in nodes {
        if let Some(range) = milestone.node_chunk_info.get(node) {
            low = low.max(range.min);
            high = high.min(range.max);
        }
    }
    (low <= high).then_some((low, high))
}

/// Record `node_id` in `milestone` and decide whether it may replicate.
///
/// Returns the verdict and whether the milestone was modified.
pub fn evaluate(
    milestone: &mut MilestoneInfo,
    node_id: &str,
    range: ChunkVersionRange,
    tweaks: &TweakValues,
    ignore_version_check: bool,
) -> (Compatibility, bool) {
    let mut changed = milestone.register_chunk_range(node_id, range);

    let accepted = milestone.is_accepted(node_id);
    let participants = milestone
        .accepted_nodes
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(node_id));
    if chunk_version_intersection(milestone, participants).is_none() && !ignore_version_check {
        return (
            Compatibility::Incompatible("chunk format versions of accepted nodes do not overlap".to_string()),
            changed,
        );
    }

    if milestone.locked {
        let verdict = if accepted {
            Compatibility::Locked
        } else {
            Compatibility::NodeLocked
        };
        return (verdict, changed);
    }

    if milestone.is_cleaned() && !accepted {
        return (Compatibility::NodeCleaned, changed);
    }

    changed |= milestone.accept(node_id);
    changed |= milestone.register_tweak_values(node_id, tweaks);

    if let Some(preferred) = milestone.tweak_values.get(DEVICE_ID_PREFERRED) {
        if preferred.should_match_differs(tweaks) {
            return (Compatibility::Mismatched(Box::new(preferred.clone())), changed);
        }
    }
    for other in &milestone.accepted_nodes {
        if other == node_id {
            continue;
        }
        if let Some(theirs) = milestone.tweak_values.get(other) {
            if theirs.should_match_differs(tweaks) {
                return (Compatibility::Mismatched(Box::new(theirs.clone())), changed);
            }
        }
    }

    (Compatibility::Ok, changed)
}

/// Load the remote milestone (initializing it if absent), evaluate, and
/// write it back if it changed.
///
/// The write is best-effort: losing a revision race is logged and the
/// verdict stands. Blocking verdicts (`Incompatible`, `NodeLocked`,
/// `NodeCleaned`) never write.
pub async fn ensure_database_is_compatible(
    db: &dyn Database,
    settings: &RemoteDbSettings,
    node_id: &str,
    range: ChunkVersionRange,
) -> Result<Compatibility> {
    let loaded = get_typed::<MilestoneInfo>(db, MILESTONE_DOCID)
        .await
        .map_err(|e| ReplicationError::store("get milestone", e))?;
    let (mut milestone, created) = match loaded {
        Some(m) => (m, false),
        None => (MilestoneInfo::initial(node_id, range), true),
    };

    let tweaks = settings.tweak_values();
    let (verdict, changed) = evaluate(
        &mut milestone,
        node_id,
        range,
        &tweaks,
        settings.ignore_version_check,
    );

    let writable = matches!(
        verdict,
        Compatibility::Ok | Compatibility::Locked | Compatibility::Mismatched(_)
    );
    if (changed || created) && writable {
        match put_typed(db, &milestone).await {
            Ok(_) => debug!(node_id, "Milestone updated"),
            Err(e) if e.is_conflict() => {
                warn!(node_id, error = %e, "Milestone changed concurrently; registration deferred");
            }
            Err(e) => return Err(ReplicationError::store("put milestone", e)),
        }
    }

    metrics::record_compat_verdict(verdict.label());
    Ok(verdict)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fingerprint differences
// ═══════════════════════════════════════════════════════════════════════════════

/// How harmful a differing fingerprint field is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TweakDifference {
    /// Nodes would produce unreadable or conflicting documents.
    Incompatible,
    /// Works, but the change should be adopted everywhere.
    Recommended,
    /// Works, but deduplication across nodes is lost.
    CompatibleButLossy,
    Compatible,
}

/// Classify a change of `key` from `current` to `proposed`.
pub fn classify_tweak_difference(key: &str, current: Option<&Value>, proposed: Option<&Value>) -> TweakDifference {
    match key {
        "encrypt"
        | "passphraseFingerprint"
        | "usePathObfuscation"
        | "useDynamicIterationCount"
        | "handleFilenameCaseSensitive" => {
            TweakDifference::Incompatible
        }
        "doNotUseFixedRevisionForChunks" => {
            let was = current.and_then(Value::as_bool).unwrap_or(false);
            let now = proposed.and_then(Value::as_bool).unwrap_or(false);
            match (was, now) {
                (_, true) => TweakDifference::Incompatible,
                (true, false) => TweakDifference::Recommended,
                (false, false) => TweakDifference::Compatible,
            }
        }
        "hashAlg" => TweakDifference::CompatibleButLossy,
        _ => TweakDifference::Compatible,
    }
}

/// Every must-agree field that differs, with its classification.
pub fn tweak_differences(current: &TweakValues, proposed: &TweakValues) -> Vec<(&'static str, TweakDifference)> {
    let current_map = current.to_map();
    let proposed_map = proposed.to_map();
    current
        .differing_keys(proposed, SHOULD_MATCH_KEYS)
        .into_iter()
        .map(|key| {
            (
                key,
                classify_tweak_difference(key, current_map.get(key), proposed_map.get(key)),
            )
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync options
// ═══════════════════════════════════════════════════════════════════════════════

/// Pull selector that leaves chunks on the remote for on-demand fetching.
pub fn on_demand_pull_selector() -> Value {
    json!({ "type": { "$ne": "leaf" } })
}

/// Base options and session options for `settings`.
///
/// Live sessions add `live`, `retry`, and a heartbeat unless the settings
/// ask for request timeouts instead.
pub fn build_sync_options(
    settings: &RemoteDbSettings,
    keep_alive: bool,
    heartbeat: Duration,
) -> (SyncOptions, SyncOptions) {
    let base = SyncOptions {
        batch_size: settings.batch_size,
        batches_limit: settings.batches_limit,
        pull_selector: settings.read_chunks_online.then(on_demand_pull_selector),
        live: false,
        retry: false,
        heartbeat: None,
    };
    let options = if keep_alive {
        SyncOptions {
            live: true,
            retry: true,
            heartbeat: (!settings.use_timeouts).then_some(heartbeat),
            ..base.clone()
        }
    } else {
        base.clone()
    };
    (base, options)
}
