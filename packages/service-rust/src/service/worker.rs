//! Background maintenance: periodic key synchronization and on-demand
//! maintenance tasks.
//!
//! `BackgroundWorker<R>` drives a `BackgroundRunnable` from an mpsc channel
//! plus a tick interval. `KeySyncRunnable` is the runnable the service uses;
//! it goes through the dispatcher like any other caller, so background syncs
//! share the worker pool and show up in the same logs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyop_core::request::KeySyncParcel;
use keyop_core::{CryptoInput, DispatchId, Request};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::DispatcherConfig;
use super::dispatcher::Dispatcher;
use super::progress::LogReplyTarget;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// MaintenanceTask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    /// Refresh keys whose metadata is older than the stale threshold.
    SyncStaleKeys,
    /// Refresh every key regardless of age.
    SyncAllKeys,
    /// Forget all sync timestamps so the next sync refreshes everything.
    ResetSyncTimestamps,
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Runs a `BackgroundRunnable` on its own task until stopped.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Starts the worker. Task channel capacity is fixed at 256.
    pub fn start(mut runnable: R, tick: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick_interval = tokio::time::interval(tick);
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            tick_interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = tick_interval.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task for the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker and waits for its task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// KeySyncRunnable
// ---------------------------------------------------------------------------

/// Dispatches `KEY_SYNC` on every tick and handles maintenance tasks.
///
/// At most one background sync is in flight; a tick that finds the previous
/// one still running is skipped.
pub struct KeySyncRunnable {
    dispatcher: Dispatcher,
    current: Option<DispatchId>,
}

impl KeySyncRunnable {
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            current: None,
        }
    }

    /// Starts a worker that dispatches a stale-key sync every
    /// `config.key_sync_interval`.
    #[must_use]
    pub fn spawn(dispatcher: Dispatcher, config: &DispatcherConfig) -> BackgroundWorker<Self> {
        // `tokio::time::interval` rejects a zero period.
        let tick = config.key_sync_interval.max(Duration::from_millis(1));
        info!(interval_secs = tick.as_secs(), "background key sync scheduled");
        BackgroundWorker::start(Self::new(dispatcher), tick)
    }

    fn sync(&mut self, refresh_all: bool) {
        if let Some(id) = self.current {
            if self.dispatcher.is_in_flight(id) {
                debug!(dispatch_id = %id, "key sync still running, skipping");
                return;
            }
        }
        let request = Request::KeySync {
            payload: KeySyncParcel { refresh_all },
        };
        match self
            .dispatcher
            .dispatch(request, CryptoInput::default(), Arc::new(LogReplyTarget))
        {
            Ok(handle) => {
                info!(dispatch_id = %handle.id(), refresh_all, "background key sync started");
                self.current = Some(handle.id());
            }
            Err(e) => debug!(error = %e, "background key sync not started"),
        }
    }
}

#[async_trait]
impl BackgroundRunnable for KeySyncRunnable {
    type Task = MaintenanceTask;

    async fn run(&mut self, task: MaintenanceTask) {
        match task {
            MaintenanceTask::SyncStaleKeys => self.sync(false),
            MaintenanceTask::SyncAllKeys => self.sync(true),
            MaintenanceTask::ResetSyncTimestamps => {
                match self.dispatcher.repository().reset_all_metadata().await {
                    Ok(count) => info!(count, "key sync timestamps reset"),
                    Err(e) => warn!(error = %format!("{e:#}"), "failed to reset sync timestamps"),
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sync(false);
    }

    async fn shutdown(&mut self) {
        if let Some(id) = self.current.take() {
            self.dispatcher.cancel(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use keyop_core::KeyId;

    use super::*;
    use crate::service::domain::now_millis;
    use crate::test_utils::{public_ring, TestBed};
    use crate::traits::KeyRepository;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
    }

    impl CountingRunnable {
        fn new() -> (Self, [Arc<AtomicU32>; 3]) {
            let counters = [
                Arc::new(AtomicU32::new(0)),
                Arc::new(AtomicU32::new(0)),
                Arc::new(AtomicU32::new(0)),
            ];
            let runnable = Self {
                run_count: Arc::clone(&counters[0]),
                tick_count: Arc::clone(&counters[1]),
                shutdown_called: Arc::clone(&counters[2]),
            };
            (runnable, counters)
        }
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = MaintenanceTask;

        async fn run(&mut self, _task: MaintenanceTask) {
            self.run_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.tick_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn eventually<F, Fut>(check: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn start_submit_and_stop() {
        let (runnable, [runs, _, shutdowns]) = CountingRunnable::new();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_secs(60));

        worker.submit(MaintenanceTask::SyncStaleKeys).await.unwrap();
        worker.submit(MaintenanceTask::ResetSyncTimestamps).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        worker.stop().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(worker.submit(MaintenanceTask::SyncAllKeys).await.is_err());
    }

    #[tokio::test]
    async fn tick_fires_periodically() {
        let (runnable, [_, ticks, _]) = CountingRunnable::new();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn sync_task_refreshes_keys_through_dispatcher() {
        let bed = TestBed::new([public_ring(1, "a@example.org")]);
        let mut remote = public_ring(1, "a@example.org");
        remote.revoked = true;
        bed.keyserver.publish(remote);

        let mut worker =
            BackgroundWorker::start(KeySyncRunnable::new(bed.dispatcher()), Duration::from_secs(60));
        worker.submit(MaintenanceTask::SyncStaleKeys).await.unwrap();

        eventually(|| {
            let repository = Arc::clone(&bed.repository);
            async move { repository.get(KeyId(1)).await.unwrap().unwrap().revoked }
        })
        .await;
        worker.stop().await;
    }

    #[tokio::test]
    async fn configured_interval_drives_key_sync() {
        let bed = TestBed::new([public_ring(1, "a@example.org")]);
        let mut remote = public_ring(1, "a@example.org");
        remote.revoked = true;
        bed.keyserver.publish(remote);

        let config = DispatcherConfig {
            key_sync_interval: Duration::from_millis(20),
            ..DispatcherConfig::default()
        };
        // No task is submitted: only the tick can start the sync.
        let mut worker = KeySyncRunnable::spawn(bed.dispatcher(), &config);
        eventually(|| {
            let repository = Arc::clone(&bed.repository);
            async move { repository.get(KeyId(1)).await.unwrap().unwrap().revoked }
        })
        .await;
        worker.stop().await;
    }

    #[tokio::test]
    async fn default_interval_does_not_sync_on_start() {
        let bed = TestBed::new([public_ring(1, "a@example.org")]);
        let mut remote = public_ring(1, "a@example.org");
        remote.revoked = true;
        bed.keyserver.publish(remote);

        let mut worker = KeySyncRunnable::spawn(bed.dispatcher(), &DispatcherConfig::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;
        assert!(!bed.repository.get(KeyId(1)).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn reset_task_clears_timestamps() {
        let bed = TestBed::new([public_ring(1, "a@example.org")]);
        bed.repository
            .renew_metadata(KeyId(1), true, now_millis())
            .await
            .unwrap();

        let mut worker =
            BackgroundWorker::start(KeySyncRunnable::new(bed.dispatcher()), Duration::from_secs(60));
        worker.submit(MaintenanceTask::ResetSyncTimestamps).await.unwrap();

        eventually(|| {
            let repository = Arc::clone(&bed.repository);
            async move {
                let meta = repository.metadata(KeyId(1)).await.unwrap().unwrap();
                meta.last_updated_millis.is_none()
            }
        })
        .await;
        worker.stop().await;
    }
}
