//! Optimistic Mutation Gateway
//!
//! The only write path for synchronized records. A mutation is applied to
//! the local store immediately (visible before network confirmation) and a
//! durable queue entry is created in the same call; if the enqueue fails
//! the local write is undone, so a record is never shown as present
//! without a corresponding durable intent to sync it.

use crate::db::DbError;
use crate::sync::models::{Operation, Record, RecordType, SyncStatus};
use crate::sync::queue::{OutboundQueue, QueueError};
use crate::sync::store::LocalStore;
use serde_json::Value;

/// Gateway errors, in the order the write path can hit them
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Caller error: rejected before touching storage, never retried
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    /// Local I/O failure: the mutation was not applied
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] DbError),

    /// Durability failure after the local write; the write was rolled back
    #[error("failed to enqueue mutation: {0}")]
    EnqueueFailed(String),
}

/// Applies mutations optimistically and records durable sync intent
#[derive(Clone)]
pub struct MutationGateway {
    store: LocalStore,
    queue: OutboundQueue,
}

impl MutationGateway {
    pub fn new(store: LocalStore, queue: OutboundQueue) -> Self {
        Self { store, queue }
    }

    /// Apply one mutation. Returns the record id (generated for creates).
    ///
    /// Steps: validate payload shape, stamp id/timestamp/status, write
    /// locally, enqueue. An enqueue failure rolls the local write back and
    /// reports [`GatewayError::EnqueueFailed`].
    pub fn apply(
        &self,
        record_type: RecordType,
        op: Operation,
        payload: Value,
    ) -> Result<String, GatewayError> {
        validate_payload(record_type, op, &payload)?;

        let id = match payload.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        // Captured before the optimistic write so it can be undone
        let prior = self.store.get(record_type, &id)?;

        let record = match op {
            Operation::Create => {
                if prior.as_ref().is_some_and(|p| !p.deleted) {
                    return Err(GatewayError::InvalidMutation(format!(
                        "record {}/{} already exists",
                        record_type.as_str(),
                        id
                    )));
                }
                Record::new(record_type, id.clone(), strip_meta(payload))
            }
            Operation::Update => {
                let Some(existing) = prior.clone() else {
                    return Err(GatewayError::InvalidMutation(format!(
                        "record {}/{} does not exist",
                        record_type.as_str(),
                        id
                    )));
                };
                if existing.deleted {
                    return Err(GatewayError::InvalidMutation(format!(
                        "record {}/{} is deleted",
                        record_type.as_str(),
                        id
                    )));
                }
                Record::new(record_type, id.clone(), strip_meta(payload))
            }
            Operation::Delete => {
                let Some(existing) = prior.clone() else {
                    return Err(GatewayError::InvalidMutation(format!(
                        "record {}/{} does not exist",
                        record_type.as_str(),
                        id
                    )));
                };
                let mut record = Record::new(record_type, id.clone(), existing.payload);
                record.deleted = true;
                record
            }
        };

        // Optimistic local write: visible to the application from here on
        self.store.upsert(&record)?;

        let snapshot = record.snapshot();
        if let Err(e) = self.queue.enqueue(record_type, &id, op, &snapshot) {
            // Compensating undo: restore the prior row, or remove a row
            // that never existed before this call.
            let undo = match &prior {
                Some(previous) => self.store.upsert(previous),
                None => self.store.remove(record_type, &id),
            };
            if let Err(undo_err) = undo {
                log::error!(
                    "Rollback of {}/{} after enqueue failure also failed: {}",
                    record_type.as_str(),
                    id,
                    undo_err
                );
            }
            return Err(match e {
                QueueError::Database(db) => GatewayError::EnqueueFailed(db.to_string()),
                other => GatewayError::EnqueueFailed(other.to_string()),
            });
        }

        log::debug!(
            "Applied {} {}/{} optimistically",
            op.as_str(),
            record_type.as_str(),
            id
        );
        Ok(id)
    }

    /// Begin a composite multi-record operation
    pub fn saga(&self) -> MutationSaga<'_> {
        MutationSaga {
            gateway: self,
            compensations: Vec::new(),
        }
    }

    /// Re-apply a prior snapshot as a fresh pending mutation, reviving the
    /// record if the step being compensated deleted it. The normal update
    /// guard against deleted records must not apply here.
    fn restore(&self, record_type: RecordType, id: &str, payload: Value) -> Result<(), GatewayError> {
        let record = Record::new(record_type, id.to_string(), strip_meta(payload));
        self.store.upsert(&record)?;
        self.queue
            .enqueue(record_type, id, Operation::Update, &record.snapshot())
            .map_err(|e| GatewayError::EnqueueFailed(e.to_string()))?;
        Ok(())
    }
}

// ============================================================================
// Saga for composite operations
// ============================================================================

enum Compensation {
    /// Undo a create by deleting the record (the delete propagates too,
    /// since the create may already have been pushed)
    DeleteCreated(RecordType, String),
    /// Undo an update/delete by re-applying the prior snapshot
    Restore(RecordType, String, Value),
}

/// Ordered multi-apply with compensating actions.
///
/// The engine gives no cross-record atomicity; a saga records, per step,
/// how to compensate it, and on the first failure runs the recorded
/// compensations in reverse, best-effort, before returning the error.
pub struct MutationSaga<'a> {
    gateway: &'a MutationGateway,
    compensations: Vec<Compensation>,
}

impl MutationSaga<'_> {
    /// Apply one step; on failure compensate all earlier steps
    pub fn apply(
        &mut self,
        record_type: RecordType,
        op: Operation,
        payload: Value,
    ) -> Result<String, GatewayError> {
        let prior = payload
            .get("id")
            .and_then(Value::as_str)
            .map(|id| self.gateway.store.get(record_type, id))
            .transpose()?
            .flatten();

        match self.gateway.apply(record_type, op, payload) {
            Ok(id) => {
                let compensation = match prior {
                    None => Compensation::DeleteCreated(record_type, id.clone()),
                    Some(previous) => {
                        Compensation::Restore(record_type, id.clone(), previous.payload)
                    }
                };
                self.compensations.push(compensation);
                Ok(id)
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Run compensations in reverse order, best-effort
    fn rollback(&mut self) {
        log::warn!(
            "Composite mutation failed, compensating {} earlier step(s)",
            self.compensations.len()
        );
        while let Some(compensation) = self.compensations.pop() {
            let result = match compensation {
                Compensation::DeleteCreated(rt, id) => self
                    .gateway
                    .apply(rt, Operation::Delete, serde_json::json!({ "id": id }))
                    .map(|_| ()),
                // Goes through `restore`, not `apply`: the compensated step
                // may have been a delete, and the prior snapshot must be
                // able to revive the record.
                Compensation::Restore(rt, id, payload) => self.gateway.restore(rt, &id, payload),
            };
            if let Err(e) = result {
                log::error!("Saga compensation failed: {}", e);
            }
        }
    }
}

// ============================================================================
// Payload validation
// ============================================================================

/// Cheap, synchronous shape check, run before any storage access
fn validate_payload(
    record_type: RecordType,
    op: Operation,
    payload: &Value,
) -> Result<(), GatewayError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| GatewayError::InvalidMutation("payload must be a JSON object".into()))?;

    if matches!(op, Operation::Update | Operation::Delete)
        && obj.get("id").and_then(Value::as_str).is_none()
    {
        return Err(GatewayError::InvalidMutation(format!(
            "{} requires an 'id' field",
            op.as_str()
        )));
    }

    if op == Operation::Delete {
        return Ok(());
    }

    let required: &[&str] = match record_type {
        RecordType::Expense => &["amount", "description"],
        RecordType::Split => &["expense_id", "participant_id", "amount"],
        RecordType::ParticipantLink => &["expense_id", "participant_id"],
        RecordType::Tag => &["name"],
        RecordType::Settlement => &["from_participant_id", "to_participant_id", "amount"],
    };

    for field in required {
        if !obj.contains_key(*field) {
            return Err(GatewayError::InvalidMutation(format!(
                "{} payload missing required field '{}'",
                record_type.as_str(),
                field
            )));
        }
    }

    Ok(())
}

/// Drop engine-owned fields the caller may have echoed back
fn strip_meta(payload: Value) -> Value {
    match payload {
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
