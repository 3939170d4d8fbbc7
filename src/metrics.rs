// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Recorded through the `metrics` facade; the host installs whatever
//! exporter it wants. Covers:
//! - Session status and duration
//! - Documents transferred per direction
//! - Sequence progress
//! - Busy rejections, retries, resurrections
//! - Compatibility verdicts
//! - On-demand chunk fetches and bulk chunk uploads
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `livesync_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use livesync_replicator::metrics;
//! use livesync_replicator::stream::Direction;
//!
//! metrics::record_docs_transferred(Direction::Pull, 25);
//! metrics::record_retry(15, 15);
//! ```

use crate::replicator::SyncStatus;
use crate::store::SyncMode;
use crate::stream::Direction;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record the current session status.
pub fn record_sync_status(status: SyncStatus) {
    gauge!("livesync_sync_status", "status" => status.to_string()).set(1.0);
    counter!("livesync_sync_status_transitions_total", "status" => status.to_string()).increment(1);
}

/// Record documents sent or arrived.
pub fn record_docs_transferred(direction: Direction, count: usize) {
    counter!("livesync_docs_transferred_total", "direction" => direction.to_string())
        .increment(count as u64);
}

/// Record the last sequence reached in a direction.
pub fn record_last_seq(direction: Direction, seq: u64) {
    gauge!("livesync_last_seq", "direction" => direction.to_string()).set(seq as f64);
}

/// Record a pulled batch the host failed to apply.
pub fn record_apply_failure(count: usize) {
    counter!("livesync_apply_failures_total").increment(1);
    counter!("livesync_apply_failed_docs_total").increment(count as u64);
}

/// Record a session abandoned for lack of a pacing permit.
pub fn record_busy_rejection() {
    counter!("livesync_busy_rejections_total").increment(1);
}

/// Record a retry with shrunk batch parameters.
pub fn record_retry(batch_size: u32, batches_limit: u32) {
    counter!("livesync_retries_total").increment(1);
    gauge!("livesync_retry_batch_size").set(f64::from(batch_size));
    gauge!("livesync_retry_batches_limit").set(f64::from(batches_limit));
}

/// Record a reopen with the original settings.
pub fn record_resurrect() {
    counter!("livesync_resurrections_total").increment(1);
}

/// Record the outcome of a compatibility check.
pub fn record_compat_verdict(verdict: &str) {
    counter!("livesync_compat_verdicts_total", "verdict" => verdict.to_string()).increment(1);
}

/// Record an on-demand chunk fetch.
pub fn record_chunk_fetch(requested: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("livesync_chunk_fetches_total", "status" => status).increment(1);
    if success {
        counter!("livesync_chunks_fetched_total").increment(requested as u64);
    }
}

/// Record one bulk chunk upload.
pub fn record_chunks_sent(count: usize, bytes: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("livesync_chunk_uploads_total", "status" => status).increment(1);
    if success {
        counter!("livesync_chunks_sent_total").increment(count as u64);
        histogram!("livesync_chunk_upload_bytes").record(bytes as f64);
    }
}

/// Record how long a session attempt ran.
pub fn record_session_duration(mode: SyncMode, live: bool, duration: Duration) {
    histogram!(
        "livesync_session_duration_seconds",
        "mode" => mode.to_string(),
        "live" => if live { "true" } else { "false" }
    )
    .record(duration.as_secs_f64());
}
