//! Sync Engine
//!
//! Orchestrates sync passes: drains and pushes the outbound queue, then
//! optionally pulls a reconciliation snapshot of remote changes and feeds
//! it through the change applier.
//!
//! Re-entrancy: at most one pass runs at a time. A trigger received while
//! a pass is in flight does not start a second pass; it requests a rerun
//! and awaits the result published after the follow-up, so mutations
//! enqueued during the in-flight pass are picked up immediately rather
//! than waiting for a future trigger. Any number of coalesced triggers
//! produce exactly one additional pass.

use crate::db::Database;
use crate::sync::applier::ChangeApplier;
use crate::sync::models::{SyncConfig, SyncState, SyncStatus};
use crate::sync::queue::OutboundQueue;
use crate::sync::remote::{RemoteError, RemoteStore};
use crate::sync::store::LocalStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::watch;

const LAST_PULL_SETTING: &str = "sync.last_pull_at";

/// Outcome of one sync pass (or of a coalesced trigger, which reports the
/// follow-up pass it waited for)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    /// Entries acknowledged by the remote
    pub pushed: usize,
    /// Entries that failed transiently and will be retried with backoff
    pub transient_failures: usize,
    /// Entries permanently rejected and surfaced as failed
    pub permanent_failures: usize,
    /// Inbound change events applied from the reconciliation pull
    pub pulled: usize,
    /// Non-fatal errors encountered during the pass
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn is_clean(&self) -> bool {
        self.transient_failures == 0 && self.permanent_failures == 0 && self.errors.is_empty()
    }
}

#[derive(Default)]
struct PassState {
    running: bool,
    rerun_requested: bool,
}

/// Coordinates the queue, the applier, and the remote store
#[derive(Clone)]
pub struct SyncEngine {
    store: LocalStore,
    queue: OutboundQueue,
    applier: ChangeApplier,
    remote: Arc<dyn RemoteStore>,
    db: Arc<Database>,
    config: SyncConfig,
    pass_state: Arc<StdMutex<PassState>>,
    result_tx: Arc<watch::Sender<Option<SyncResult>>>,
    state_tx: Arc<watch::Sender<SyncState>>,
}

impl SyncEngine {
    pub fn new(db: Arc<Database>, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let store = LocalStore::new(db.clone());
        let queue = OutboundQueue::new(db.clone());
        let applier = ChangeApplier::new(store.clone(), queue.clone());
        let (result_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(SyncState::Idle);

        Self {
            store,
            queue,
            applier,
            remote,
            db,
            config,
            pass_state: Arc::new(StdMutex::new(PassState::default())),
            result_tx: Arc::new(result_tx),
            state_tx: Arc::new(state_tx),
        }
    }

    /// Subscribe to the engine state (idle / syncing / error)
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    /// Run a sync pass, or coalesce into the one already running.
    ///
    /// The caller always observes a result that reflects its own
    /// mutations: either it owns the pass, or it awaits the result
    /// published after the follow-up pass its trigger guaranteed.
    pub async fn trigger_sync(&self) -> SyncResult {
        // Owner-or-waiter is decided with the lock confined to this block,
        // and a waiter takes its subscription while still holding the lock:
        // the owner cannot publish before the subscription exists, because
        // it must reacquire the lock first to observe the rerun request.
        let waiter = {
            let mut state = self
                .pass_state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if state.running {
                state.rerun_requested = true;
                Some(self.result_tx.subscribe())
            } else {
                state.running = true;
                None
            }
        };

        if let Some(mut result_rx) = waiter {
            log::debug!("Sync already in flight, coalescing trigger");
            // The owner publishes once, after rerun requests drain
            if result_rx.changed().await.is_err() {
                return SyncResult::default();
            }
            let result = result_rx.borrow().clone();
            return result.unwrap_or_default();
        }

        self.state_tx.send_replace(SyncState::Syncing);

        let result = loop {
            let result = self.run_pass().await;

            let rerun = {
                let mut state = self
                    .pass_state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if state.rerun_requested {
                    state.rerun_requested = false;
                    true
                } else {
                    state.running = false;
                    false
                }
            };
            if rerun {
                log::info!("Coalesced trigger pending, running follow-up pass");
                continue;
            }
            break result;
        };

        self.state_tx.send_replace(if result.is_clean() {
            SyncState::Idle
        } else {
            SyncState::Error
        });
        self.result_tx.send_replace(Some(result.clone()));

        log::info!(
            "Sync pass complete: pushed={} transient={} permanent={} pulled={} errors={}",
            result.pushed,
            result.transient_failures,
            result.permanent_failures,
            result.pulled,
            result.errors.len()
        );
        result
    }

    /// One pass: push half, then pull half
    async fn run_pass(&self) -> SyncResult {
        let mut result = SyncResult::default();
        self.push_queue(&mut result).await;
        if self.config.pull_on_sync {
            self.pull_reconciliation(&mut result).await;
        }
        result
    }

    /// Push every ready queue entry. Each entry is processed and its
    /// outcome recorded independently; one record's failure never aborts
    /// the rest of the pass.
    async fn push_queue(&self, result: &mut SyncResult) {
        let entries = match self.queue.drain() {
            Ok(entries) => entries,
            Err(e) => {
                result.errors.push(format!("queue drain failed: {}", e));
                return;
            }
        };

        if !entries.is_empty() {
            log::info!("Pushing {} queued mutation(s)", entries.len());
        }

        for entry in entries {
            // The entry may have been superseded by an inbound change or
            // replaced by a coalesced mutation while earlier entries were
            // pushed; a stale snapshot is never sent.
            match self.queue.pending_entry(entry.record_type, &entry.record_id) {
                Ok(Some(current))
                    if current.seq == entry.seq && current.updated_at == entry.updated_at => {}
                Ok(_) => continue,
                Err(e) => {
                    result.errors.push(format!(
                        "queue lookup for {}/{} failed: {}",
                        entry.record_type.as_str(),
                        entry.record_id,
                        e
                    ));
                    continue;
                }
            }

            match self.remote.push_entry(&entry).await {
                Ok(()) => match self.queue.mark_succeeded(entry.seq, entry.updated_at) {
                    Ok(true) => {
                        result.pushed += 1;
                        // The record may itself be gone for link types
                        // that hard-delete; best-effort status update.
                        if let Err(e) = self.store.set_sync_status(
                            entry.record_type,
                            &entry.record_id,
                            SyncStatus::Synced,
                        ) {
                            result.errors.push(format!(
                                "recording push of {}/{} failed: {}",
                                entry.record_type.as_str(),
                                entry.record_id,
                                e
                            ));
                        }
                    }
                    // The remote acknowledged a snapshot that a mutation
                    // superseded mid-push; the entry keeps the newer state
                    // and the record stays pending until that one lands.
                    Ok(false) => result.pushed += 1,
                    Err(e) => result.errors.push(format!(
                        "recording push of {}/{} failed: {}",
                        entry.record_type.as_str(),
                        entry.record_id,
                        e
                    )),
                },
                Err(RemoteError::Transient(msg)) => {
                    result.transient_failures += 1;
                    if let Err(e) = self.queue.mark_transient_failure(entry.seq, &msg) {
                        result.errors.push(format!(
                            "recording transient failure of entry {} failed: {}",
                            entry.seq, e
                        ));
                    }
                }
                Err(RemoteError::Permanent(msg)) => {
                    result.permanent_failures += 1;
                    let recorded = self.queue.mark_failed(entry.seq, &msg).and_then(|_| {
                        self.store
                            .set_sync_status(entry.record_type, &entry.record_id, SyncStatus::Failed)
                            .map_err(Into::into)
                    });
                    if let Err(e) = recorded {
                        result.errors.push(format!(
                            "recording permanent failure of entry {} failed: {}",
                            entry.seq, e
                        ));
                    }
                }
            }
        }
    }

    /// Pull remote changes since the last successful pull and merge them.
    /// A pull failure aborts only this half of the pass.
    async fn pull_reconciliation(&self, result: &mut SyncResult) {
        let since = self.last_pull_at();
        let pull_started = Utc::now();

        let events = match self.remote.pull_changes(since).await {
            Ok(events) => events,
            Err(e) => {
                log::warn!("Reconciliation pull failed: {}", e);
                result.errors.push(format!("pull failed: {}", e));
                return;
            }
        };

        if !events.is_empty() {
            log::info!("Applying {} pulled change event(s)", events.len());
        }

        let mut all_applied = true;
        for event in &events {
            match self.applier.apply_event(event) {
                Ok(_) => result.pulled += 1,
                Err(e) => {
                    all_applied = false;
                    result.errors.push(format!(
                        "applying pulled event for {}/{} failed: {}",
                        event.record_type.as_str(),
                        event.record_id,
                        e
                    ));
                }
            }
        }

        // The checkpoint only advances when every event landed; an event
        // that failed to apply must be re-pulled, not skipped forever.
        if !all_applied {
            return;
        }

        if let Err(e) = self
            .db
            .set_setting(LAST_PULL_SETTING, &pull_started.to_rfc3339())
        {
            result
                .errors
                .push(format!("saving pull checkpoint failed: {}", e));
        }
    }

    fn last_pull_at(&self) -> Option<DateTime<Utc>> {
        self.db
            .get_setting::<String>(LAST_PULL_SETTING)
            .ok()
            .flatten()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn applier(&self) -> &ChangeApplier {
        &self.applier
    }
}
