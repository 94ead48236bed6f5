//! Network Status Monitor
//!
//! Tracks connectivity transitions from platform signals and publishes
//! the current status to subscribers. On an Offline -> Online transition
//! with auto-sync enabled it fires the injected sync trigger exactly once
//! per transition, never once per listener. The trigger is a closure
//! passed at construction; the monitor holds no reference to any other
//! component and owns no ambient global state.

use crate::sync::models::{ConnectionQuality, NetworkStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Raw connectivity signal from the platform boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivitySignal {
    Online(ConnectionQuality),
    Offline,
}

/// Injected reconnect action (typically spawns a sync pass)
pub type SyncTrigger = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkMonitorError {
    #[error("monitor is already running")]
    AlreadyRunning,

    #[error("monitor is not running")]
    NotRunning,
}

/// Connectivity monitor with an explicit start/stop lifecycle
#[derive(Clone)]
pub struct NetworkMonitor {
    status_tx: Arc<watch::Sender<NetworkStatus>>,
    running: Arc<AtomicBool>,
    auto_sync: Arc<AtomicBool>,
    trigger: SyncTrigger,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl NetworkMonitor {
    /// Create a monitor. Starts Offline until the first platform signal.
    pub fn new(trigger: SyncTrigger, auto_sync: bool) -> Self {
        let (status_tx, _) = watch::channel(NetworkStatus::offline());
        Self {
            status_tx: Arc::new(status_tx),
            running: Arc::new(AtomicBool::new(false)),
            auto_sync: Arc::new(AtomicBool::new(auto_sync)),
            trigger,
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Current status snapshot
    pub fn status(&self) -> NetworkStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status_tx.subscribe()
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        self.auto_sync.store(enabled, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start consuming platform signals
    pub fn start(
        &self,
        signals: mpsc::Receiver<ConnectivitySignal>,
    ) -> Result<(), NetworkMonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(NetworkMonitorError::AlreadyRunning);
        }

        let status_tx = self.status_tx.clone();
        let running = self.running.clone();
        let auto_sync = self.auto_sync.clone();
        let trigger = self.trigger.clone();

        let handle = tokio::spawn(async move {
            Self::monitor_loop(signals, status_tx, running, auto_sync, trigger).await;
        });

        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        log::info!("Network monitor started");
        Ok(())
    }

    /// Stop the monitor task
    pub fn stop(&self) -> Result<(), NetworkMonitorError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(NetworkMonitorError::NotRunning);
        }

        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        log::info!("Network monitor stopped");
        Ok(())
    }

    async fn monitor_loop(
        mut signals: mpsc::Receiver<ConnectivitySignal>,
        status_tx: Arc<watch::Sender<NetworkStatus>>,
        running: Arc<AtomicBool>,
        auto_sync: Arc<AtomicBool>,
        trigger: SyncTrigger,
    ) {
        while let Some(signal) = signals.recv().await {
            if !running.load(Ordering::Relaxed) {
                break;
            }

            let previous = *status_tx.borrow();
            let next = match signal {
                ConnectivitySignal::Online(quality) => NetworkStatus::online(quality),
                ConnectivitySignal::Offline => NetworkStatus::offline(),
            };

            if next == previous {
                continue;
            }

            log::info!(
                "Network status changed: online={} quality={:?}",
                next.online,
                next.quality
            );
            status_tx.send_replace(next);

            // One trigger per Offline -> Online transition. Quality
            // changes while already online never re-trigger.
            if next.online && !previous.online && auto_sync.load(Ordering::Relaxed) {
                log::info!("Reconnected, triggering sync");
                (trigger)();
            }
        }

        running.store(false, Ordering::SeqCst);
        log::info!("Network monitor loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
