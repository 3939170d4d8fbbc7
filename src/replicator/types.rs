//! Session state types.
//!
//! # State Transitions
//!
//! ```text
//!                   open_*()
//! NOT_CONNECTED ────────────────→ STARTED
//!                                    │ active
//!                                    ↓
//!                   ┌──────────→ CONNECTED ←──────────┐
//!                   │                │                 │ active
//!                   │      paused    ↓                 │
//!                   │             PAUSED ──────────────┘
//!                   │                │
//!      complete     │       error /  │ denied        close_replication()
//!   ┌───────────────┘                ↓                        │
//!   ↓                             ERRORED                     ↓
//! COMPLETED                                                CLOSED
//! ```
//!
//! `JOURNAL_SEND` and `JOURNAL_RECEIVE` are never entered by this engine;
//! they exist for hosts that drive journal transports through the same
//! status channel.

use crate::error::ReplicationError;

/// Status of the replicator's current (or last) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    NotConnected,
    Started,
    Connected,
    Paused,
    Completed,
    Closed,
    Errored,
    JournalSend,
    JournalReceive,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::NotConnected => write!(f, "NOT_CONNECTED"),
            SyncStatus::Started => write!(f, "STARTED"),
            SyncStatus::Connected => write!(f, "CONNECTED"),
            SyncStatus::Paused => write!(f, "PAUSED"),
            SyncStatus::Completed => write!(f, "COMPLETED"),
            SyncStatus::Closed => write!(f, "CLOSED"),
            SyncStatus::Errored => write!(f, "ERRORED"),
            SyncStatus::JournalSend => write!(f, "JOURNAL_SEND"),
            SyncStatus::JournalReceive => write!(f, "JOURNAL_RECEIVE"),
        }
    }
}

/// Session counters, published through a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStat {
    /// Documents pushed, over the replicator's lifetime.
    pub sent: u64,
    /// Documents pulled and applied, over the replicator's lifetime.
    pub arrived: u64,
    /// Remote `update_seq` when the session started.
    pub max_pull_seq: u64,
    /// Local `update_seq` when the session started.
    pub max_push_seq: u64,
    pub last_sync_pull_seq: u64,
    pub last_sync_push_seq: u64,
    pub sync_status: SyncStatus,
}

impl ReplicationStat {
    /// Progress line: `↑{sent} ({LIVE|remaining}) ↓{arrived} ({LIVE|remaining})`.
    ///
    /// Counts are relative to `baseline`. A direction that has not recorded
    /// a sequence yet omits its suffix.
    pub fn progress_line(&self, baseline: &ReplicationStat) -> String {
        format!(
            "↑{}{} ↓{}{}",
            self.sent.saturating_sub(baseline.sent),
            progress_suffix(self.last_sync_push_seq, self.max_push_seq),
            self.arrived.saturating_sub(baseline.arrived),
            progress_suffix(self.last_sync_pull_seq, self.max_pull_seq),
        )
    }

    /// Documents moved in either direction since `baseline`.
    pub fn transferred_since(&self, baseline: &ReplicationStat) -> u64 {
        self.sent.saturating_sub(baseline.sent) + self.arrived.saturating_sub(baseline.arrived)
    }
}

fn progress_suffix(last: u64, max: u64) -> String {
    if last == 0 {
        String::new()
    } else if last >= max {
        " (LIVE)".to_string()
    } else {
        format!(" ({})", max - last)
    }
}

/// Result of one session attempt, before retry handling.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Done,
    /// Transient failure; shrink batches and re-run.
    NeedRetry,
    /// A degraded retry is healthy again; re-run with the original settings.
    NeedResurrect,
    Failed(ReplicationError),
    Cancelled,
}

/// Shrink one batch parameter for a retry: `ceil(n / 2) + 2`.
pub fn shrink_batch(n: u32) -> u32 {
    n.div_ceil(2).saturating_add(2)
}

/// Both parameters at or below this after shrinking means give up.
pub const MIN_RETRY_BATCH: u32 = 5;

/// Shrunk `(batch_size, batches_limit)`, or `None` when both would be at or
/// below [`MIN_RETRY_BATCH`].
pub fn next_retry_batches(batch_size: u32, batches_limit: u32) -> Option<(u32, u32)> {
    let next = (shrink_batch(batch_size), shrink_batch(batches_limit));
    (next.0 > MIN_RETRY_BATCH || next.1 > MIN_RETRY_BATCH).then_some(next)
}
