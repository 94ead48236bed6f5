//! # SplitSync
//!
//! Offline-first synchronization engine for shared expense ledgers.
//!
//! Every mutation applies to the local SQLite store first and the UI
//! reads local state only; a background engine pushes queued mutations
//! to the shared remote store and merges remote changes back in with
//! per-record last-writer-wins. The app remains fully usable offline.

pub mod db;
pub mod sync;

pub use db::{Database, DbError, DbResult};
pub use sync::{
    ChangeApplier, ChangeEvent, ConnectivitySignal, HttpRemote, MutationGateway, MutationSaga,
    NetworkMonitor, Operation, OutboundQueue, Record, RecordType, RemoteError, RemoteStore,
    SyncConfig, SyncEngine, SyncResult, SyncState, SyncStatus,
};
