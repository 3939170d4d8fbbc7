// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Session attempts and per-event processing.
//!
//! # Attempt Loop
//!
//! ```text
//! loop {
//!     claim slot ─► check connectivity ─► STARTED ─► replicate ─► process_sync
//!     match outcome {
//!         DONE / CANCELLED / FAILED  => return,
//!         NEED_RETRY                 => batch_size, batches_limit = ceil(n/2)+2; retrying = true,
//!         NEED_RESURRECT             => original settings; retrying = false,
//!     }
//! }
//! ```
//!
//! The slot is released between attempts, so a retry re-claims it like any
//! other caller would.

use super::types::{next_retry_batches, AttemptOutcome, ReplicationStat, SyncStatus};
use super::{lock, ConnectivityResult, LiveSyncReplicator, SessionGuard};
use crate::config::RemoteDbSettings;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::seq_of;
use crate::store::{ReplicationRequest, ReplicatorEnv, SyncMode};
use crate::stream::{mailbox, ChangeBatch, Direction, ReplicationEvent, ReplicationEventStream};
use std::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

const ONE_SHOT_KEY: &str = "oneShotReplication";
const CONTINUOUS_KEY: &str = "continuousReplication";

/// What to do after an attempt.
enum Step {
    Finished(bool),
    Rerun {
        settings: RemoteDbSettings,
        retrying: bool,
    },
}

impl<E: ReplicatorEnv> LiveSyncReplicator<E> {
    /// Initialize the node id, then replicate once (`keep_alive = false`)
    /// or continuously.
    pub async fn open_replication(
        &self,
        settings: &RemoteDbSettings,
        keep_alive: bool,
        show_result: bool,
        ignore_clean_lock: bool,
    ) -> Result<bool> {
        self.node_id().await?;
        if keep_alive {
            self.open_continuous_replication(settings, show_result, false).await
        } else {
            self.open_one_shot_replication(settings, show_result, false, SyncMode::Sync, ignore_clean_lock)
                .await
        }
    }

    /// Replicate once in `mode`.
    ///
    /// Returns `Ok(true)` when the replication completed and `Ok(false)`
    /// when it was cancelled. Concurrent callers join the run in flight.
    pub async fn open_one_shot_replication(
        &self,
        settings: &RemoteDbSettings,
        show_result: bool,
        retrying: bool,
        mode: SyncMode,
        ignore_clean_lock: bool,
    ) -> Result<bool> {
        let this = self.clone();
        let settings = settings.clone();
        self.inner
            .running
            .share(ONE_SHOT_KEY, move || async move {
                this.run_one_shot(settings, show_result, retrying, mode, ignore_clean_lock)
                    .await
            })
            .await
    }

    /// Push everything local to the remote once.
    pub async fn replicate_all_to_server(&self, settings: &RemoteDbSettings, show_result: bool) -> Result<bool> {
        self.open_one_shot_replication(settings, show_result, false, SyncMode::PushOnly, false)
            .await
    }

    /// Pull everything from the remote once.
    pub async fn replicate_all_from_server(&self, settings: &RemoteDbSettings, show_result: bool) -> Result<bool> {
        self.open_one_shot_replication(settings, show_result, false, SyncMode::PullOnly, false)
            .await
    }

    /// Pull once to catch up, then keep a live bidirectional session open
    /// until [`close_replication`](Self::close_replication).
    pub async fn open_continuous_replication(
        &self,
        settings: &RemoteDbSettings,
        show_result: bool,
        retrying: bool,
    ) -> Result<bool> {
        let this = self.clone();
        let settings = settings.clone();
        self.inner
            .running
            .share(CONTINUOUS_KEY, move || async move {
                this.run_continuous(settings, show_result, retrying).await
            })
            .await
    }

    async fn run_one_shot(
        &self,
        settings: RemoteDbSettings,
        show_result: bool,
        retrying: bool,
        mode: SyncMode,
        ignore_clean_lock: bool,
    ) -> Result<bool> {
        let span = info_span!("replication", mode = %mode, live = false);
        async move {
            let mut settings = settings;
            let mut retrying = retrying;
            loop {
                let started = Instant::now();
                let outcome = self
                    .one_shot_attempt(&settings, show_result, retrying, mode, ignore_clean_lock)
                    .await?;
                metrics::record_session_duration(mode, false, started.elapsed());
                match self.step_after(outcome, &settings, show_result)? {
                    Step::Finished(done) => return Ok(done),
                    Step::Rerun {
                        settings: next,
                        retrying: next_retrying,
                    } => {
                        settings = next;
                        retrying = next_retrying;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_continuous(&self, settings: RemoteDbSettings, show_result: bool, retrying: bool) -> Result<bool> {
        if self.is_session_active() {
            notice!(show_result, "Another replication running.");
            return Err(ReplicationError::AlreadyRunning);
        }

        let mut settings = settings;
        let mut retrying = retrying;
        loop {
            // Priming runs as a fresh one-shot; a retry keeps the settings
            // saved by the first attempt for resurrection.
            let saved = retrying.then(|| lock(&self.inner.original_setting).clone());
            let primed = self
                .run_one_shot(settings.clone(), show_result, false, SyncMode::PullOnly, false)
                .await;
            if let Some(saved) = saved {
                *lock(&self.inner.original_setting) = saved;
            }
            if !primed? {
                return Ok(false);
            }

            let span = info_span!("replication", mode = %SyncMode::Sync, live = true);
            let started = Instant::now();
            let outcome = self
                .continuous_attempt(&settings, show_result, retrying)
                .instrument(span)
                .await?;
            metrics::record_session_duration(SyncMode::Sync, true, started.elapsed());
            match self.step_after(outcome, &settings, show_result)? {
                Step::Finished(done) => return Ok(done),
                Step::Rerun {
                    settings: next,
                    retrying: next_retrying,
                } => {
                    settings = next;
                    retrying = next_retrying;
                }
            }
        }
    }

    async fn one_shot_attempt(
        &self,
        settings: &RemoteDbSettings,
        show_result: bool,
        retrying: bool,
        mode: SyncMode,
        ignore_clean_lock: bool,
    ) -> Result<AttemptOutcome> {
        let session = self.claim_session()?;
        let connectivity = self
            .check_connectivity(settings, false, retrying, show_result, ignore_clean_lock)
            .await?;
        if !self.begin_session(settings, &connectivity, retrying, &session).await? {
            return Ok(AttemptOutcome::Cancelled);
        }

        let request = ReplicationRequest {
            mode,
            options: connectivity.options.clone(),
        };
        let stream = self.open_stream(&connectivity, request, &session);
        notice!(show_result, "Replication started ({})", mode);
        let original_batch_size = self.original_batch_size(settings);
        Ok(self
            .process_sync(stream, mode, original_batch_size, show_result, retrying, false)
            .await)
    }

    async fn continuous_attempt(
        &self,
        settings: &RemoteDbSettings,
        show_result: bool,
        retrying: bool,
    ) -> Result<AttemptOutcome> {
        let session = self.claim_session()?;
        let connectivity = self.check_connectivity(settings, true, true, show_result, false).await?;
        if !self.begin_session(settings, &connectivity, retrying, &session).await? {
            return Ok(AttemptOutcome::Cancelled);
        }

        let request = ReplicationRequest {
            mode: SyncMode::Sync,
            options: connectivity.options.clone(),
        };
        let stream = self.open_stream(&connectivity, request, &session);
        notice!(show_result, "Live replication started");
        let original_batch_size = self.original_batch_size(settings);
        Ok(self
            .process_sync(stream, SyncMode::Sync, original_batch_size, show_result, retrying, true)
            .await)
    }

    /// Record the sequence heads, mark STARTED, and remember the settings
    /// of a first (non-retry) attempt.
    ///
    /// Returns false, touching nothing, if the session was closed while
    /// connecting.
    async fn begin_session(
        &self,
        settings: &RemoteDbSettings,
        connectivity: &ConnectivityResult,
        retrying: bool,
        session: &SessionGuard,
    ) -> Result<bool> {
        let local_info = self
            .inner
            .env
            .local_database()
            .info()
            .await
            .map_err(|e| ReplicationError::store("local info", e))?;
        if session.token().is_cancelled() {
            debug!("Session closed before the replication started");
            return Ok(false);
        }
        let max_pull_seq = seq_of(&connectivity.connection.info.update_seq);
        let max_push_seq = seq_of(&local_info.update_seq);
        self.update_stat(|s| {
            s.max_pull_seq = max_pull_seq;
            s.max_push_seq = max_push_seq;
        });
        self.set_status(SyncStatus::Started);
        if !retrying {
            *lock(&self.inner.original_setting) = Some(settings.clone());
        }
        Ok(true)
    }

    fn open_stream(
        &self,
        connectivity: &ConnectivityResult,
        request: ReplicationRequest,
        session: &SessionGuard,
    ) -> ReplicationEventStream {
        let (sink, rx) = mailbox();
        let handle = self
            .inner
            .env
            .local_database()
            .replicate(connectivity.connection.db.clone(), request, sink);
        ReplicationEventStream::new(rx, handle, session.token())
    }

    fn step_after(&self, outcome: AttemptOutcome, settings: &RemoteDbSettings, show_result: bool) -> Result<Step> {
        match outcome {
            AttemptOutcome::Done => Ok(Step::Finished(true)),
            AttemptOutcome::Cancelled => Ok(Step::Finished(false)),
            AttemptOutcome::Failed(e) => Err(e),
            AttemptOutcome::NeedResurrect => {
                let original = lock(&self.inner.original_setting)
                    .clone()
                    .unwrap_or_else(|| settings.clone());
                notice!(
                    show_result,
                    "Replication is healthy again, resuming with batch_size {}",
                    original.batch_size
                );
                metrics::record_resurrect();
                Ok(Step::Rerun {
                    settings: original,
                    retrying: false,
                })
            }
            AttemptOutcome::NeedRetry => match next_retry_batches(settings.batch_size, settings.batches_limit) {
                Some((batch_size, batches_limit)) => {
                    notice!(
                        show_result,
                        "Retry with lower batch size:{}/{}",
                        batch_size,
                        batches_limit
                    );
                    metrics::record_retry(batch_size, batches_limit);
                    Ok(Step::Rerun {
                        settings: RemoteDbSettings {
                            batch_size,
                            batches_limit,
                            ..settings.clone()
                        },
                        retrying: true,
                    })
                }
                None => {
                    warn!(
                        batch_size = settings.batch_size,
                        batches_limit = settings.batches_limit,
                        "We can't replicate more lower value."
                    );
                    Err(ReplicationError::RetryExhausted {
                        batch_size: settings.batch_size,
                        batches_limit: settings.batches_limit,
                    })
                }
            },
        }
    }

    /// Consume `stream` until the attempt resolves.
    ///
    /// Every event first passes the pacing controller; a refused permit
    /// ends the attempt as busy.
    pub(super) async fn process_sync(
        &self,
        mut stream: ReplicationEventStream,
        mode: SyncMode,
        original_batch_size: u32,
        show_result: bool,
        retrying: bool,
        report_cancelled_as_done: bool,
    ) -> AttemptOutcome {
        let baseline = self.stat();
        let busy_timeout = self.inner.config.busy_timeout_duration();

        while let Some(event) = stream.next().await {
            match self.inner.pacing.acquire(1, busy_timeout).await {
                Ok(permit) => permit.release(),
                Err(busy) => {
                    metrics::record_busy_rejection();
                    notice!(show_result, waited = ?busy.waited, "Replication stopped for busy.");
                    return AttemptOutcome::Failed(ReplicationError::Busy);
                }
            }

            match event {
                ReplicationEvent::Change(batch) => {
                    let direction = match (batch.direction, mode) {
                        (Some(direction), _) => direction,
                        (None, SyncMode::PullOnly) => Direction::Pull,
                        (None, SyncMode::PushOnly) => Direction::Push,
                        (None, SyncMode::Sync) => continue,
                    };
                    self.apply_change(direction, batch).await;
                    let stat = self.stat();
                    notice!(show_result, "{}", stat.progress_line(&baseline));
                    if retrying && stat.transferred_since(&baseline) > u64::from(original_batch_size) * 2 {
                        return AttemptOutcome::NeedResurrect;
                    }
                }
                ReplicationEvent::Complete => {
                    self.set_status(SyncStatus::Completed);
                    notice!(show_result, "Replication completed");
                    return AttemptOutcome::Done;
                }
                ReplicationEvent::Active => {
                    self.set_status(SyncStatus::Connected);
                    debug!("Replication activated");
                }
                ReplicationEvent::Paused(failure) => {
                    self.set_status(SyncStatus::Paused);
                    match failure {
                        Some(failure) => debug!(error = %failure, "Replication paused"),
                        None => debug!("Replication paused"),
                    }
                }
                ReplicationEvent::Denied(failure) => {
                    self.set_status(SyncStatus::Errored);
                    warn!(error = %failure, "Replication denied");
                    return AttemptOutcome::Failed(ReplicationError::Denied(failure.to_string()));
                }
                ReplicationEvent::Error(failure) => {
                    self.set_status(SyncStatus::Errored);
                    if self.inner.env.last_post_failed_by_size() && failure.status == Some(413) {
                        warn!(error = %failure, "Request too large; lower the batch size or batches limit");
                        return AttemptOutcome::Failed(ReplicationError::PayloadTooLarge(failure.to_string()));
                    }
                    notice!(show_result, error = %failure, "Replication error");
                    return AttemptOutcome::NeedRetry;
                }
                ReplicationEvent::Finally => {}
            }
        }

        if report_cancelled_as_done {
            AttemptOutcome::Done
        } else {
            AttemptOutcome::Cancelled
        }
    }

    async fn apply_change(&self, direction: Direction, batch: ChangeBatch) {
        let seq = seq_of(&batch.last_seq);
        let count = batch.docs.len();
        match direction {
            Direction::Pull => {
                if let Err(e) = self.inner.env.apply_incoming(batch.docs).await {
                    warn!(error = %e, count, "Replication callback error");
                    metrics::record_apply_failure(count);
                    return;
                }
                self.update_stat(|s| {
                    s.arrived += count as u64;
                    s.last_sync_pull_seq = s.last_sync_pull_seq.max(seq);
                });
            }
            Direction::Push => {
                self.update_stat(|s| {
                    s.sent += count as u64;
                    s.last_sync_push_seq = s.last_sync_push_seq.max(seq);
                });
            }
        }
        metrics::record_docs_transferred(direction, count);
        let stat: ReplicationStat = self.stat();
        let last = match direction {
            Direction::Pull => stat.last_sync_pull_seq,
            Direction::Push => stat.last_sync_push_seq,
        };
        metrics::record_last_seq(direction, last);
    }
}
