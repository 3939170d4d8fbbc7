//! Mock host environment.
//!
//! Records connection requests and incoming documents. Several `MockEnv`s
//! can share one remote to play different nodes.

use super::mock_store::{MockDatabase, MockLocalDatabase, Script};
use livesync_replicator::model::RawDocument;
use livesync_replicator::store::{
    BoxFuture, ConnectRequest, Database, DatabaseInfo, LocalDatabase, MemoryTaskQueue, RemoteConnection, ReplicatorEnv,
    TaskQueue,
};
use livesync_replicator::{LiveSyncReplicator, RemoteDbSettings, ReplicatorConfig, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_URI: &str = "http://couch.test:5984";

pub struct MockEnv {
    remote: Arc<MockDatabase>,
    local: Arc<MockLocalDatabase>,
    queue: Arc<MemoryTaskQueue>,
    settings: Mutex<RemoteDbSettings>,
    applied: Mutex<Vec<RawDocument>>,
    connects: Mutex<Vec<ConnectRequest>>,
    unreachable: AtomicBool,
    fail_apply: AtomicBool,
    post_failed_by_size: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl MockEnv {
    pub fn new() -> Self {
        Self::with_remote(Arc::new(MockDatabase::new("vault")))
    }

    /// Another node on an existing remote.
    pub fn with_remote(remote: Arc<MockDatabase>) -> Self {
        Self {
            remote,
            local: Arc::new(MockLocalDatabase::new()),
            queue: Arc::new(MemoryTaskQueue::new()),
            settings: Mutex::new(RemoteDbSettings::for_testing(TEST_URI)),
            applied: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            fail_apply: AtomicBool::new(false),
            post_failed_by_size: AtomicBool::new(false),
            connect_delay: Mutex::new(None),
        }
    }

    pub fn remote(&self) -> &Arc<MockDatabase> {
        &self.remote
    }

    pub fn local(&self) -> &Arc<MockLocalDatabase> {
        &self.local
    }

    pub fn queue(&self) -> &Arc<MemoryTaskQueue> {
        &self.queue
    }

    pub fn push_script(&self, script: Script) {
        self.local.push_script(script);
    }

    pub fn set_settings(&self, settings: RemoteDbSettings) {
        *self.settings.lock().unwrap() = settings;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn set_post_failed_by_size(&self, failed: bool) {
        self.post_failed_by_size.store(failed, Ordering::SeqCst);
    }

    /// Hold every connection attempt for `delay` after recording it.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Documents handed to `apply_incoming`, in order.
    pub fn applied(&self) -> Vec<RawDocument> {
        self.applied.lock().unwrap().clone()
    }

    pub fn connects(&self) -> Vec<ConnectRequest> {
        self.connects.lock().unwrap().clone()
    }
}

impl ReplicatorEnv for MockEnv {
    fn connect_remote(&self, request: ConnectRequest) -> BoxFuture<'_, RemoteConnection> {
        Box::pin(async move {
            let skip_info = request.skip_info;
            self.connects.lock().unwrap().push(request);
            let delay = *self.connect_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(StoreError::Other("connection refused".to_string()));
            }
            let info = if skip_info {
                DatabaseInfo::default()
            } else {
                self.remote.info().await?
            };
            Ok(RemoteConnection {
                db: self.remote.clone(),
                info,
            })
        })
    }

    fn local_database(&self) -> Arc<dyn LocalDatabase> {
        self.local.clone()
    }

    fn apply_incoming(&self, docs: Vec<RawDocument>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_apply.load(Ordering::SeqCst) {
                return Err(StoreError::Other("host rejected documents".to_string()));
            }
            self.applied.lock().unwrap().extend(docs);
            Ok(())
        })
    }

    fn settings(&self) -> RemoteDbSettings {
        self.settings.lock().unwrap().clone()
    }

    fn task_queue(&self) -> Arc<dyn TaskQueue> {
        self.queue.clone()
    }

    fn last_post_failed_by_size(&self) -> bool {
        self.post_failed_by_size.load(Ordering::SeqCst)
    }
}

/// A replicator over a fresh environment with test timings.
pub fn replicator() -> (LiveSyncReplicator<MockEnv>, Arc<MockEnv>) {
    replicator_on(Arc::new(MockEnv::new()))
}

pub fn replicator_on(env: Arc<MockEnv>) -> (LiveSyncReplicator<MockEnv>, Arc<MockEnv>) {
    let replicator = LiveSyncReplicator::new(Arc::clone(&env), ReplicatorConfig::for_testing());
    (replicator, env)
}

/// Settings pointing at the mock remote.
pub fn settings() -> RemoteDbSettings {
    RemoteDbSettings::for_testing(TEST_URI)
}
