//! Sync scheduling: explicit requests, reconnect triggers and periodic passes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use draftsync_common::{Error, Result};
use draftsync_storage::ConnectivitySubscription;

use crate::state::SyncReport;

/// When the scheduler starts passes on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Explicit requests only.
    Manual,
    /// Also on every offline to online transition.
    #[default]
    OnReconnect,
    /// On reconnect and at a fixed interval.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn watches_connectivity(&self) -> bool {
        !matches!(self, SyncMode::Manual)
    }

    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } => Some(*interval),
            _ => None,
        }
    }
}

/// Why a pass was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Someone called [`SyncScheduler::request_sync`].
    Requested,
    /// The device came back online.
    Reconnected,
    /// The periodic timer fired.
    Periodic,
    /// A write was queued while online.
    FollowUp,
}

/// A pass to run, and where to send its report.
type Request = (SyncTrigger, Option<oneshot::Sender<SyncReport>>);

/// Front side of the scheduler, used to request passes and stop it.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: SyncMode,
    request_tx: mpsc::Sender<Request>,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    /// Create a scheduler; the returned handle must be run on a task.
    ///
    /// Cancelling `shutdown` stops the background loop.
    pub fn new(mode: SyncMode, shutdown: CancellationToken) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
            shutdown: shutdown.clone(),
        };
        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a pass and wait for its report.
    ///
    /// Requests are served one at a time in arrival order.
    ///
    /// # Errors
    /// - `Cancelled` if the scheduler is no longer running
    pub async fn request_sync(&self) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncTrigger::Requested, Some(response_tx)))
            .await
            .map_err(|_| Error::Cancelled)?;

        response_rx.await.map_err(|_| Error::Cancelled)
    }

    /// Ask for a pass without waiting for it.
    ///
    /// Dropped if the scheduler has stopped or its request queue is full.
    pub fn request_follow_up(&self) {
        match self.request_tx.try_send((SyncTrigger::FollowUp, None)) {
            Ok(()) => debug!("Follow-up sync requested"),
            Err(e) => debug!("Follow-up sync not requested: {}", e),
        }
    }

    /// Configured mode.
    pub fn mode(&self) -> &SyncMode {
        &self.mode
    }

    /// Stop the background loop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Background side of the scheduler.
pub struct SyncSchedulerHandle {
    mode: SyncMode,
    request_rx: mpsc::Receiver<Request>,
    shutdown: CancellationToken,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown.
    ///
    /// This should be spawned in a tokio task. `sync_fn` is called whenever a
    /// pass is needed; calls never overlap.
    pub async fn run<F, Fut>(mut self, mut connectivity: ConnectivitySubscription, sync_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncReport> + Send,
    {
        let mut periodic = self.mode.interval().map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let mut watch_connectivity = self.mode.watches_connectivity();

        info!("Sync scheduler started ({:?})", self.mode);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Sync scheduler shutting down");
                    break;
                }

                request = self.request_rx.recv() => {
                    let Some((trigger, response_tx)) = request else {
                        debug!("All scheduler fronts dropped");
                        break;
                    };
                    let report = sync_fn(trigger).await;
                    match response_tx {
                        Some(response_tx) => {
                            let _ = response_tx.send(report);
                        }
                        None => log_report(trigger, &report),
                    }
                }

                reconnected = wait_for_reconnect(&mut connectivity, watch_connectivity) => {
                    match reconnected {
                        Some(()) => {
                            info!("Connectivity restored, starting sync");
                            log_report(SyncTrigger::Reconnected, &sync_fn(SyncTrigger::Reconnected).await);
                        }
                        None => {
                            warn!("Connectivity monitor dropped, reconnect triggers disabled");
                            watch_connectivity = false;
                        }
                    }
                }

                _ = wait_for_tick(&mut periodic) => {
                    debug!("Triggering periodic sync");
                    log_report(SyncTrigger::Periodic, &sync_fn(SyncTrigger::Periodic).await);
                }
            }
        }
    }
}

async fn wait_for_reconnect(
    connectivity: &mut ConnectivitySubscription,
    enabled: bool,
) -> Option<()> {
    if enabled {
        connectivity.next_online().await
    } else {
        std::future::pending().await
    }
}

async fn wait_for_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_report(trigger: SyncTrigger, report: &SyncReport) {
    if report.success {
        info!(
            "{:?} sync completed: {} processed, {} conflicts",
            trigger,
            report.items_processed,
            report.conflicts.len()
        );
    } else {
        warn!(
            "{:?} sync failed: {}",
            trigger,
            report.error_message.as_deref().unwrap_or("unknown error")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use draftsync_storage::ConnectivityMonitor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn ok_report() -> SyncReport {
        let mut report = SyncReport::failure("unused");
        report.success = true;
        report.error_message = None;
        report.items_processed = 1;
        report
    }

    #[test]
    fn test_default_mode() {
        assert_eq!(SyncMode::default(), SyncMode::OnReconnect);
    }

    #[tokio::test]
    async fn test_sync_request() {
        let monitor = ConnectivityMonitor::new(true);
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual, CancellationToken::new());

        let sync_count = Arc::new(AtomicU32::new(0));
        let count_clone = sync_count.clone();

        let task = tokio::spawn(handle.run(monitor.subscribe(), move |trigger| {
            let count = count_clone.clone();
            async move {
                assert_eq!(trigger, SyncTrigger::Requested);
                count.fetch_add(1, Ordering::SeqCst);
                ok_report()
            }
        }));

        let report = scheduler.request_sync().await.unwrap();
        assert_eq!(report.items_processed, 1);
        assert_eq!(sync_count.load(Ordering::SeqCst), 1);

        scheduler.shutdown();
        task.await.unwrap();
        assert!(matches!(scheduler.request_sync().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_reconnect_triggers_pass() {
        let monitor = ConnectivityMonitor::new(false);
        let (scheduler, handle) =
            SyncScheduler::new(SyncMode::OnReconnect, CancellationToken::new());

        let ran = Arc::new(Notify::new());
        let ran_clone = ran.clone();
        let task = tokio::spawn(handle.run(monitor.subscribe(), move |trigger| {
            let ran = ran_clone.clone();
            async move {
                assert_eq!(trigger, SyncTrigger::Reconnected);
                ran.notify_one();
                ok_report()
            }
        }));

        monitor.set_online(true);
        tokio::time::timeout(Duration::from_secs(5), ran.notified())
            .await
            .unwrap();

        scheduler.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_follow_up_request() {
        let monitor = ConnectivityMonitor::new(true);
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual, CancellationToken::new());

        let ran = Arc::new(Notify::new());
        let ran_clone = ran.clone();
        let task = tokio::spawn(handle.run(monitor.subscribe(), move |trigger| {
            let ran = ran_clone.clone();
            async move {
                assert_eq!(trigger, SyncTrigger::FollowUp);
                ran.notify_one();
                ok_report()
            }
        }));

        scheduler.request_follow_up();
        tokio::time::timeout(Duration::from_secs(5), ran.notified())
            .await
            .unwrap();

        scheduler.shutdown();
        task.await.unwrap();
        // A stopped scheduler drops the request quietly.
        scheduler.request_follow_up();
    }

    #[tokio::test]
    async fn test_manual_mode_ignores_reconnect() {
        let monitor = ConnectivityMonitor::new(false);
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual, CancellationToken::new());

        let sync_count = Arc::new(AtomicU32::new(0));
        let count_clone = sync_count.clone();
        let task = tokio::spawn(handle.run(monitor.subscribe(), move |_| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                ok_report()
            }
        }));

        monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sync_count.load(Ordering::SeqCst), 0);

        scheduler.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_mode() {
        let monitor = ConnectivityMonitor::new(true);
        let (scheduler, handle) = SyncScheduler::new(
            SyncMode::Periodic {
                interval: Duration::from_secs(60),
            },
            CancellationToken::new(),
        );

        let sync_count = Arc::new(AtomicU32::new(0));
        let count_clone = sync_count.clone();
        let task = tokio::spawn(handle.run(monitor.subscribe(), move |trigger| {
            let count = count_clone.clone();
            async move {
                assert_eq!(trigger, SyncTrigger::Periodic);
                count.fetch_add(1, Ordering::SeqCst);
                ok_report()
            }
        }));

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(sync_count.load(Ordering::SeqCst), 2);

        scheduler.shutdown();
        task.await.unwrap();
    }
}
