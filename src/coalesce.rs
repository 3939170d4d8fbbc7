// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request coalescing.
//!
//! Callers that ask for the same operation while it is in flight join it and
//! receive a clone of its result instead of starting a second run. The entry
//! is cleared when the run completes, so the next request starts fresh.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

type Pending<T> = Shared<BoxFuture<'static, T>>;

/// In-flight operations keyed by name.
pub struct RunningResults<T: Clone> {
    pending: Arc<Mutex<HashMap<String, Pending<T>>>>,
}

impl<T> RunningResults<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `make()` under `key`, or join the run already in flight.
    ///
    /// `make` is only called when no run for `key` exists.
    pub async fn share<F, Fut>(&self, key: &str, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let fut = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.get(key) {
                Some(fut) => fut.clone(),
                None => {
                    let registry = self.pending.clone();
                    let owned_key = key.to_string();
                    let run = make();
                    let fut = async move {
                        let result = run.await;
                        registry
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&owned_key);
                        result
                    }
                    .boxed()
                    .shared();
                    pending.insert(key.to_string(), fut.clone());
                    fut
                }
            }
        };
        fut.await
    }

    /// Check if a run for `key` is in flight.
    pub fn is_running(&self, key: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

impl<T> Default for RunningResults<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let results: Arc<RunningResults<usize>> = Arc::new(RunningResults::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let results = results.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                results
                    .share("op", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        7
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(results.is_running("op"));

        let second = {
            let results = results.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                results
                    .share("op", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        99
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = release_tx.send(());

        assert_eq!(first.await.unwrap(), 7);
        assert_eq!(second.await.unwrap(), 7);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_cleared_after_completion() {
        let results: RunningResults<u32> = RunningResults::new();
        assert_eq!(results.share("op", || async { 1 }).await, 1);
        assert!(!results.is_running("op"));
        assert_eq!(results.share("op", || async { 2 }).await, 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let results: RunningResults<&'static str> = RunningResults::new();
        let (a, b) = tokio::join!(
            results.share("a", || async { "a" }),
            results.share("b", || async { "b" }),
        );
        assert_eq!((a, b), ("a", "b"));
    }
}
