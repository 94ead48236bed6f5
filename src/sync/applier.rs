//! Inbound Change Applier
//!
//! Consumes change events from the remote push stream (or from a
//! reconciliation pull) and merges them into the local store under
//! last-writer-wins by `updated_at`, per record. Delivery is at-least-once
//! and cross-record ordering is not guaranteed, so the merge never trusts
//! arrival order and is idempotent: applying the same event twice yields
//! the same end state.
//!
//! Deletes are the one deliberate asymmetry: they apply regardless of
//! relative timestamps, and a pending outbound edit cannot revive a
//! deleted record.

use crate::db::DbError;
use crate::sync::models::{ChangeEvent, Operation, Record, RecordType, SyncStatus};
use crate::sync::queue::{OutboundQueue, QueueError};
use crate::sync::store::LocalStore;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outcome of merging one change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Event accepted; local record overwritten with the remote snapshot
    Applied,
    /// Event same-age-or-older than local state; dropped silently
    Discarded,
    /// Delete event applied as a soft delete
    SoftDeleted,
    /// Delete event for a non-soft-deleting type; row removed
    Removed,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplierError {
    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("{0} event for {1} is missing a snapshot")]
    MissingSnapshot(&'static str, String),
}

/// Merges inbound change events into the local store
#[derive(Clone)]
pub struct ChangeApplier {
    store: LocalStore,
    queue: OutboundQueue,
}

impl ChangeApplier {
    pub fn new(store: LocalStore, queue: OutboundQueue) -> Self {
        Self { store, queue }
    }

    /// Merge one event. Idempotent; safe under duplication and reordering.
    pub fn apply_event(&self, event: &ChangeEvent) -> Result<MergeOutcome, ApplierError> {
        match event.op {
            Operation::Delete => self.apply_delete(event),
            // A create for an id that already exists locally (replay or id
            // collision) degrades to an update through the same LWW write.
            Operation::Create | Operation::Update => self.apply_upsert(event),
        }
    }

    fn apply_upsert(&self, event: &ChangeEvent) -> Result<MergeOutcome, ApplierError> {
        let snapshot = event.snapshot.as_ref().ok_or_else(|| {
            ApplierError::MissingSnapshot(event.op.as_str(), event.record_id.clone())
        })?;

        let record = record_from_snapshot(event, snapshot);
        let accepted = self.store.upsert_if_newer(&record)?;

        if !accepted {
            // Local state is at least as current; the expected steady-state
            // case when an event echoes a change this device originated.
            log::debug!(
                "Discarded stale {} event for {}/{}",
                event.op.as_str(),
                event.record_type.as_str(),
                event.record_id
            );
            return Ok(MergeOutcome::Discarded);
        }

        // The remote write is authoritative now; a pending outbound entry
        // snapshots older local state and must not be re-sent.
        self.queue.discard(event.record_type, &event.record_id)?;

        log::debug!(
            "Applied {} event for {}/{}",
            event.op.as_str(),
            event.record_type.as_str(),
            event.record_id
        );
        Ok(MergeOutcome::Applied)
    }

    fn apply_delete(&self, event: &ChangeEvent) -> Result<MergeOutcome, ApplierError> {
        // The delete lands first; the queued entry is only discarded once
        // it has, so a storage failure leaves the pending intent intact.
        if !event.record_type.soft_deletes() {
            self.store.remove(event.record_type, &event.record_id)?;
            self.queue.discard(event.record_type, &event.record_id)?;
            return Ok(MergeOutcome::Removed);
        }

        match self.store.soft_delete(
            event.record_type,
            &event.record_id,
            event.updated_at,
            SyncStatus::Synced,
        ) {
            Ok(()) => {}
            // Unknown record: insert the tombstone so a late-arriving
            // older update cannot resurrect it.
            Err(DbError::NotFound(_)) => {
                let payload = event
                    .snapshot
                    .clone()
                    .or_else(|| event.previous.clone())
                    .unwrap_or_else(|| Value::Object(Default::default()));
                let record = Record {
                    record_type: event.record_type,
                    id: event.record_id.clone(),
                    payload: strip_meta(payload),
                    updated_at: event.updated_at,
                    sync_status: SyncStatus::Synced,
                    deleted: true,
                };
                self.store.upsert(&record)?;
            }
            Err(e) => return Err(e.into()),
        }

        // Deletion dominates any queued edit, whatever its timestamp.
        self.queue.discard(event.record_type, &event.record_id)?;
        Ok(MergeOutcome::SoftDeleted)
    }

    /// Spawn a consumer for the remote push stream.
    ///
    /// Raw frames are validated into [`ChangeEvent`]s at this boundary;
    /// malformed frames are logged and dropped, never merged. The loop
    /// suspends on the channel indefinitely without blocking the local
    /// mutation path; the two only rendezvous at the store, per record.
    pub fn run_stream(self, mut frames: mpsc::Receiver<Value>) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!("Change stream consumer started");
            while let Some(frame) = frames.recv().await {
                let event = match ChangeEvent::from_value(&frame) {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("Rejected malformed change frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = self.apply_event(&event) {
                    log::error!(
                        "Failed to apply {} event for {}/{}: {}",
                        event.op.as_str(),
                        event.record_type.as_str(),
                        event.record_id,
                        e
                    );
                }
            }
            log::info!("Change stream consumer stopped");
        })
    }
}

fn record_from_snapshot(event: &ChangeEvent, snapshot: &Value) -> Record {
    let deleted = snapshot
        .get("deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Record {
        record_type: event.record_type,
        id: event.record_id.clone(),
        payload: strip_meta(snapshot.clone()),
        updated_at: event.updated_at,
        sync_status: SyncStatus::Synced,
        deleted,
    }
}

/// Engine-owned fields live in record columns, not in the payload
fn strip_meta(snapshot: Value) -> Value {
    match snapshot {
        Value::Object(mut obj) => {
            obj.remove("id");
            obj.remove("updated_at");
            obj.remove("deleted");
            Value::Object(obj)
        }
        other => other,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn fixture() -> (ChangeApplier, LocalStore, OutboundQueue) {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        let store = LocalStore::new(db.clone());
        let queue = OutboundQueue::new(db.clone());
        (ChangeApplier::new(store.clone(), queue.clone()), store, queue)
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn update_event(id: &str, amount: i64, at: &str) -> ChangeEvent {
        ChangeEvent {
            op: Operation::Update,
            record_type: RecordType::Expense,
            record_id: id.to_string(),
            updated_at: ts(at),
            snapshot: Some(json!({
                "id": id,
                "amount": amount,
                "description": "remote",
                "updated_at": at
            })),
            previous: None,
        }
    }

    fn delete_event(record_type: RecordType, id: &str, at: &str) -> ChangeEvent {
        ChangeEvent {
            op: Operation::Delete,
            record_type,
            record_id: id.to_string(),
            updated_at: ts(at),
            snapshot: None,
            previous: Some(json!({"id": id})),
        }
    }

    #[test]
    fn test_create_event_inserts_synced_record() {
        let (applier, store, _) = fixture();

        let mut event = update_event("e1", 50, "2026-03-01T10:00:00Z");
        event.op = Operation::Create;

        assert_eq!(applier.apply_event(&event).unwrap(), MergeOutcome::Applied);
        let record = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.payload["amount"], 50);
        // Engine-owned fields are columns, not payload
        assert!(record.payload.get("id").is_none());
        assert!(record.payload.get("updated_at").is_none());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (applier, store, _) = fixture();
        let event = update_event("e1", 75, "2026-03-01T10:00:00Z");

        assert_eq!(applier.apply_event(&event).unwrap(), MergeOutcome::Applied);
        let first = store.get(RecordType::Expense, "e1").unwrap().unwrap();

        assert_eq!(applier.apply_event(&event).unwrap(), MergeOutcome::Discarded);
        let second = store.get(RecordType::Expense, "e1").unwrap().unwrap();

        assert_eq!(first.payload, second.payload);
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[test]
    fn test_convergence_under_reordering() {
        let older = update_event("e1", 50, "2026-03-01T09:00:00Z");
        let newer = update_event("e1", 75, "2026-03-01T10:00:00Z");

        // Forward order
        let (applier, store, _) = fixture();
        applier.apply_event(&older).unwrap();
        applier.apply_event(&newer).unwrap();
        let fwd = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert_eq!(fwd.payload["amount"], 75);

        // Reversed order: same end state
        let (applier, store, _) = fixture();
        applier.apply_event(&newer).unwrap();
        assert_eq!(applier.apply_event(&older).unwrap(), MergeOutcome::Discarded);
        let rev = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert_eq!(rev.payload["amount"], 75);
        assert_eq!(rev.updated_at, fwd.updated_at);
    }

    #[test]
    fn test_newer_event_supersedes_pending_entry() {
        let (applier, store, queue) = fixture();

        // Local pending state at t0
        let mut local = Record::new(
            RecordType::Expense,
            "e1".into(),
            json!({"amount": 50, "description": "local"}),
        );
        local.updated_at = ts("2026-03-01T09:00:00Z");
        store.upsert(&local).unwrap();
        queue
            .enqueue(RecordType::Expense, "e1", Operation::Update, &local.snapshot())
            .unwrap();

        // Remote write at t1 > t0 arrives before the push runs
        let event = update_event("e1", 75, "2026-03-01T10:00:00Z");
        assert_eq!(applier.apply_event(&event).unwrap(), MergeOutcome::Applied);

        // Stale entry discarded, record at the remote snapshot
        assert!(queue.pending_entry(RecordType::Expense, "e1").unwrap().is_none());
        let record = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert_eq!(record.payload["amount"], 75);
        assert_eq!(record.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_older_event_keeps_pending_entry() {
        let (applier, store, queue) = fixture();

        let mut local = Record::new(
            RecordType::Expense,
            "e1".into(),
            json!({"amount": 50, "description": "local"}),
        );
        local.updated_at = ts("2026-03-01T10:00:00Z");
        store.upsert(&local).unwrap();
        queue
            .enqueue(RecordType::Expense, "e1", Operation::Update, &local.snapshot())
            .unwrap();

        let event = update_event("e1", 75, "2026-03-01T09:00:00Z");
        assert_eq!(applier.apply_event(&event).unwrap(), MergeOutcome::Discarded);

        // Local edit still newer: its push intent survives
        assert!(queue.pending_entry(RecordType::Expense, "e1").unwrap().is_some());
        let record = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert_eq!(record.payload["amount"], 50);
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_delete_dominates_pending_update() {
        let (applier, store, queue) = fixture();

        // Pending local edit with a *newer* timestamp than the delete
        let mut local = Record::new(
            RecordType::Expense,
            "e1".into(),
            json!({"amount": 99, "description": "local"}),
        );
        local.updated_at = ts("2026-03-01T12:00:00Z");
        store.upsert(&local).unwrap();
        queue
            .enqueue(RecordType::Expense, "e1", Operation::Update, &local.snapshot())
            .unwrap();

        let event = delete_event(RecordType::Expense, "e1", "2026-03-01T10:00:00Z");
        assert_eq!(applier.apply_event(&event).unwrap(), MergeOutcome::SoftDeleted);

        // Not revived by the queued edit: the entry is gone and the row
        // is deleted
        assert!(queue.pending_entry(RecordType::Expense, "e1").unwrap().is_none());
        let record = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert!(record.deleted);
    }

    #[test]
    fn test_delete_of_unknown_record_leaves_tombstone() {
        let (applier, store, _) = fixture();

        let event = delete_event(RecordType::Expense, "ghost", "2026-03-01T10:00:00Z");
        assert_eq!(applier.apply_event(&event).unwrap(), MergeOutcome::SoftDeleted);

        let record = store.get(RecordType::Expense, "ghost").unwrap().unwrap();
        assert!(record.deleted);

        // A late older update is discarded by the timestamp rule
        let stale = update_event("ghost", 5, "2026-03-01T09:00:00Z");
        assert_eq!(applier.apply_event(&stale).unwrap(), MergeOutcome::Discarded);
        assert!(store.get(RecordType::Expense, "ghost").unwrap().unwrap().deleted);
    }

    #[test]
    fn test_link_records_removed_outright() {
        let (applier, store, _) = fixture();

        let link = Record::new(
            RecordType::ParticipantLink,
            "l1".into(),
            json!({"expense_id": "e1", "participant_id": "p1"}),
        );
        store.upsert(&link).unwrap();

        let event = delete_event(RecordType::ParticipantLink, "l1", "2026-03-01T10:00:00Z");
        assert_eq!(applier.apply_event(&event).unwrap(), MergeOutcome::Removed);
        assert!(store.get(RecordType::ParticipantLink, "l1").unwrap().is_none());
    }

    #[test]
    fn test_failed_delete_keeps_pending_entry() {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        let store = LocalStore::new(db.clone());
        let queue = OutboundQueue::new(db.clone());
        let applier = ChangeApplier::new(store.clone(), queue.clone());

        let local = Record::new(
            RecordType::Expense,
            "e1".into(),
            json!({"amount": 50, "description": "local"}),
        );
        store.upsert(&local).unwrap();
        queue
            .enqueue(RecordType::Expense, "e1", Operation::Update, &local.snapshot())
            .unwrap();

        // Break record storage out from under the applier
        db.execute_batch("DROP TABLE records").unwrap();

        let event = delete_event(RecordType::Expense, "e1", "2026-03-01T10:00:00Z");
        let err = applier.apply_event(&event).unwrap_err();
        assert!(matches!(err, ApplierError::Storage(_)));

        // The delete did not land, so the queued intent must survive
        assert!(queue.pending_entry(RecordType::Expense, "e1").unwrap().is_some());
    }

    #[test]
    fn test_delete_event_is_idempotent() {
        let (applier, store, _) = fixture();

        let record = Record::new(
            RecordType::Expense,
            "e1".into(),
            json!({"amount": 50, "description": "x"}),
        );
        store.upsert(&record).unwrap();

        let event = delete_event(RecordType::Expense, "e1", "2026-03-01T10:00:00Z");
        applier.apply_event(&event).unwrap();
        applier.apply_event(&event).unwrap();

        let fetched = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert!(fetched.deleted);
    }

    #[tokio::test]
    async fn test_stream_consumer_skips_malformed_frames() {
        let (applier, store, _) = fixture();
        let (tx, rx) = mpsc::channel(8);

        let handle = applier.run_stream(rx);

        tx.send(json!({"not": "an event"})).await.unwrap();
        tx.send(json!({
            "op": "create",
            "table": "expenses",
            "record": {
                "id": "e1",
                "amount": 50,
                "description": "remote",
                "updated_at": "2026-03-01T10:00:00Z"
            }
        }))
        .await
        .unwrap();
        drop(tx);

        handle.await.unwrap();

        let record = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert_eq!(record.payload["amount"], 50);
    }
}
