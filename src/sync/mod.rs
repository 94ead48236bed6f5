//! Offline-first synchronization
//!
//! Local mutations apply to the local store immediately and are queued
//! for push; remote changes merge in with per-record last-writer-wins.
//! The engine serializes sync passes and coalesces concurrent triggers.

pub mod applier;
pub mod engine;
pub mod gateway;
pub mod models;
pub mod network;
pub mod queue;
pub mod remote;
pub mod store;


pub use applier::{ApplierError, ChangeApplier, MergeOutcome};
pub use engine::{SyncEngine, SyncResult};
pub use gateway::{GatewayError, MutationGateway, MutationSaga};
pub use models::{
    ChangeEvent, ConnectionQuality, NetworkStatus, Operation, Record, RecordType, SyncConfig,
    SyncState, SyncStatus,
};
pub use network::{ConnectivitySignal, NetworkMonitor, NetworkMonitorError, SyncTrigger};
pub use queue::{EntryStatus, OutboundQueue, QueueEntry, QueueError, QueueStats};
pub use remote::{HttpRemote, RemoteError, RemoteStore};
pub use store::LocalStore;
