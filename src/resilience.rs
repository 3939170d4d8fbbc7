// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: pacing, retry logic, rate limiting, bulkheads.
//!
//! - [`PacingController`]: process-wide admission control. Every replication
//!   event takes and returns one unit; a session that cannot get one within
//!   the busy timeout gives up.
//! - [`RetryConfig`] / [`retry_with_backoff`]: exponential backoff for
//!   milestone writes that lose a revision race.
//! - [`RateLimiter`]: spacing of on-demand chunk fetches.
//! - [`Bulkhead`]: concurrency cap of the bulk chunk sender.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), livesync_replicator::resilience::Busy> {
//! use livesync_replicator::resilience::{Bulkhead, PacingController};
//! use std::time::Duration;
//!
//! let pacing = PacingController::global();
//! let releaser = pacing.acquire(1, Duration::from_secs(5)).await?;
//! releaser.release();
//!
//! let bulkhead = Bulkhead::for_chunk_upload();
//! let _permit = bulkhead.acquire().await;
//! # Ok(())
//! # }
//! ```

use governor::{Quota, RateLimiter as GovLimiter, state::{InMemoryState, NotKeyed}, clock::DefaultClock, middleware::NoOpMiddleware};
use std::fmt::Display;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

// =============================================================================
// Pacing (admission control)
// =============================================================================

/// Units of the process-wide pacing controller.
pub const GLOBAL_PACING_PERMITS: usize = 50;

/// No permit became available within the timeout.
#[derive(Debug, Clone, thiserror::Error)]
#[error("pacing controller busy: no permit within {waited:?}")]
pub struct Busy {
    pub waited: Duration,
}

/// Counting semaphore shared by every replicator in the process.
///
/// Heavy work elsewhere in the host (hashing, indexing) holds units too, so
/// a session that keeps failing to get one is a sign the process is
/// saturated.
#[derive(Debug)]
pub struct PacingController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl PacingController {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// The process-wide instance.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<PacingController>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(PacingController::new(GLOBAL_PACING_PERMITS)))
            .clone()
    }

    /// Take `n` units, waiting at most `timeout`.
    pub async fn acquire(&self, n: usize, timeout: Duration) -> Result<Releaser, Busy> {
        let n = u32::try_from(n).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.semaphore.clone().acquire_many_owned(n)).await {
            Ok(Ok(permit)) => Ok(Releaser { permit }),
            _ => Err(Busy { waited: timeout }),
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Units held from a [`PacingController`]. Released on drop.
#[derive(Debug)]
pub struct Releaser {
    permit: OwnedSemaphorePermit,
}

impl Releaser {
    pub fn release(self) {
        drop(self.permit);
    }

    pub fn units(&self) -> usize {
        self.permit.num_permits()
    }
}

// =============================================================================
// Milestone Write Retry
// =============================================================================

/// Backoff schedule for milestone writes that lose a revision race.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts in total, the first write included.
    pub max_attempts: usize,

    /// Pause after the first conflict.
    pub initial_delay: Duration,

    /// Upper bound of any single pause.
    pub max_delay: Duration,

    /// Growth of the pause per conflict.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::milestone()
    }
}

impl RetryConfig {
    /// Milestone read-modify-write under contention.
    ///
    /// A conflict means another node wrote in between. The next read sees
    /// its revision, so short pauses are enough.
    ///
    /// ```text
    /// Conflict  Pause
    /// --------  -----
    /// 1         100ms
    /// 2         200ms
    /// 3         400ms
    /// 4         800ms
    /// 5         (give up)
    /// ```
    pub fn milestone() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }

    /// Millisecond pauses for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
        }
    }

    /// Pause after the `conflict`-th failure (1-based; 0 reads as 1).
    pub fn pause_after(&self, conflict: usize) -> Duration {
        let exponent = conflict.saturating_sub(1).min(i32::MAX as usize) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects,
/// or `config.max_attempts` is reached.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_attempts && should_retry(&e) => {
                let delay = config.pause_after(attempt);
                debug!(operation, attempt, ?delay, error = %e, "Retrying after failure");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Chunk Fetch Spacing
// =============================================================================

/// Spaces on-demand chunk fetches at least `period` apart.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    period: Duration,
}

impl RateLimiter {
    /// One fetch per `period`, no burst. A zero period never waits.
    pub fn every(period: Duration) -> Self {
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
            .allow_burst(NonZeroU32::MIN);
        Self {
            limiter: GovLimiter::direct(quota),
            period,
        }
    }

    /// Wait for the next slot. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take the slot only if it is free now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Chunk Upload Concurrency
// =============================================================================

/// Bulk uploads allowed in flight by [`Bulkhead::for_chunk_upload`].
pub const CHUNK_UPLOAD_CONCURRENCY: usize = 4;

/// The gate was shut while a batch waited for its turn.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upload gate closed ({slots} slots)")]
pub struct BulkheadClosed {
    pub slots: usize,
}

/// Caps how many bulk uploads run at once, independent of session pacing.
#[derive(Debug)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
    size: usize,
}

impl Bulkhead {
    pub fn new(size: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn for_chunk_upload() -> Self {
        Self::new(CHUNK_UPLOAD_CONCURRENCY)
    }

    /// Wait for a slot. Dropping the permit hands it to the next batch.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed { slots: self.size })
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}
