//! Sync Data Models
//!
//! Defines the shared types of the synchronization engine:
//! - Record: any synchronizable entity with identity, timestamp and status
//! - ChangeEvent: a validated inbound notification from the remote side
//! - NetworkStatus: connectivity snapshot published by the monitor
//! - SyncConfig: per-device engine settings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Record Types
// ============================================================================

/// Kinds of synchronizable records in a shared expense ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Expense,
    Split,
    ParticipantLink,
    Tag,
    Settlement,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expense => "expenses",
            Self::Split => "splits",
            Self::ParticipantLink => "participant_links",
            Self::Tag => "tags",
            Self::Settlement => "settlements",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "expenses" => Some(Self::Expense),
            "splits" => Some(Self::Split),
            "participant_links" => Some(Self::ParticipantLink),
            "tags" => Some(Self::Tag),
            "settlements" => Some(Self::Settlement),
            _ => None,
        }
    }

    /// Whether deletions of this type propagate as soft deletes.
    ///
    /// Pure association records are removed outright instead; there is
    /// nothing to audit and no edit that could race a deletion.
    pub fn soft_deletes(&self) -> bool {
        !matches!(self, Self::ParticipantLink)
    }
}

/// Synchronization status of a local record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "synced" => Self::Synced,
            "conflict" => Self::Conflict,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Mutation operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

// ============================================================================
// Record
// ============================================================================

/// A synchronizable entity instance.
///
/// `updated_at` is monotonic per record and set by whichever side last
/// wrote it; it drives last-writer-wins conflict resolution. Records are
/// never hard-deleted by the engine (soft-deleting types keep the row with
/// `deleted = true` for convergence and audit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub record_type: RecordType,
    pub id: String,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub deleted: bool,
}

impl Record {
    /// Create a locally originated record, pending sync
    pub fn new(record_type: RecordType, id: String, payload: Value) -> Self {
        Self {
            record_type,
            id,
            payload,
            updated_at: Utc::now(),
            sync_status: SyncStatus::Pending,
            deleted: false,
        }
    }

    /// Full snapshot of this record as sent to the remote store
    pub fn snapshot(&self) -> Value {
        let mut obj = match &self.payload {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        obj.insert("id".into(), Value::String(self.id.clone()));
        obj.insert(
            "updated_at".into(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        obj.insert("deleted".into(), Value::Bool(self.deleted));
        Value::Object(obj)
    }
}

// ============================================================================
// Change Events
// ============================================================================

/// A validated inbound change notification.
///
/// Decoded from a raw stream frame at the boundary; malformed frames are
/// rejected here so untyped data never reaches the merge logic. Transient:
/// consumed by one merge operation and never persisted.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub op: Operation,
    pub record_type: RecordType,
    pub record_id: String,
    pub updated_at: DateTime<Utc>,
    /// New snapshot; absent only for deletes that carry just the key
    pub snapshot: Option<Value>,
    /// Previous snapshot (updates only, best-effort)
    pub previous: Option<Value>,
}

/// Errors decoding a raw stream frame into a [`ChangeEvent`]
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("event frame is not a JSON object")]
    NotAnObject,

    #[error("event frame is missing field '{0}'")]
    MissingField(&'static str),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl ChangeEvent {
    /// Decode and validate a raw frame from the push stream.
    ///
    /// Expected shape: `{ "op": "...", "table": "...", "record": {...},
    /// "old_record": {...}? }`. For deletes the key may live in either
    /// `record` or `old_record`.
    pub fn from_value(frame: &Value) -> Result<Self, EventDecodeError> {
        let obj = frame.as_object().ok_or(EventDecodeError::NotAnObject)?;

        let op_str = obj
            .get("op")
            .and_then(Value::as_str)
            .ok_or(EventDecodeError::MissingField("op"))?;
        let op = Operation::from_str(op_str)
            .ok_or_else(|| EventDecodeError::UnknownOperation(op_str.to_string()))?;

        let table = obj
            .get("table")
            .and_then(Value::as_str)
            .ok_or(EventDecodeError::MissingField("table"))?;
        let record_type = RecordType::from_str(table)
            .ok_or_else(|| EventDecodeError::UnknownTable(table.to_string()))?;

        let record = obj.get("record").filter(|v| v.is_object());
        let old_record = obj.get("old_record").filter(|v| v.is_object());

        let keyed = match op {
            Operation::Delete => record.or(old_record),
            _ => record,
        }
        .ok_or(EventDecodeError::MissingField("record"))?;

        let record_id = keyed
            .get("id")
            .and_then(Value::as_str)
            .ok_or(EventDecodeError::MissingField("record.id"))?
            .to_string();

        // Deletes apply regardless of relative timestamps, so a missing
        // timestamp on a delete frame falls back to the local clock.
        let updated_at = match keyed.get("updated_at").and_then(Value::as_str) {
            Some(ts) => DateTime::parse_from_rfc3339(ts)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| EventDecodeError::InvalidTimestamp(ts.to_string()))?,
            None if op == Operation::Delete => Utc::now(),
            None => return Err(EventDecodeError::MissingField("record.updated_at")),
        };

        Ok(Self {
            op,
            record_type,
            record_id,
            updated_at,
            snapshot: record.cloned(),
            previous: old_record.cloned(),
        })
    }
}

// ============================================================================
// Network Status
// ============================================================================

/// Best-effort connection quality hint from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Unknown,
    Poor,
    Good,
    Excellent,
}

/// Connectivity snapshot, published by the network monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub online: bool,
    pub quality: ConnectionQuality,
}

impl NetworkStatus {
    pub fn offline() -> Self {
        Self {
            online: false,
            quality: ConnectionQuality::Unknown,
        }
    }

    pub fn online(quality: ConnectionQuality) -> Self {
        Self {
            online: true,
            quality,
        }
    }
}

/// Overall engine state, subscribable by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

// ============================================================================
// Sync Configuration
// ============================================================================

/// Per-device engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Trigger a pass automatically on reconnect
    pub auto_sync: bool,

    /// Run the reconciliation pull half of each pass
    pub pull_on_sync: bool,

    /// Unique device identifier (UUID v4)
    pub device_id: String,

    /// Device name, defaults to the hostname
    pub device_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            pull_on_sync: true,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: default_device_name(),
        }
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-device".to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_type_roundtrip() {
        for rt in [
            RecordType::Expense,
            RecordType::Split,
            RecordType::ParticipantLink,
            RecordType::Tag,
            RecordType::Settlement,
        ] {
            assert_eq!(RecordType::from_str(rt.as_str()), Some(rt));
        }
        assert_eq!(RecordType::from_str("nonsense"), None);
    }

    #[test]
    fn test_link_records_do_not_soft_delete() {
        assert!(RecordType::Expense.soft_deletes());
        assert!(!RecordType::ParticipantLink.soft_deletes());
    }

    #[test]
    fn test_record_snapshot_carries_identity() {
        let record = Record::new(
            RecordType::Expense,
            "e1".into(),
            json!({"amount": 50, "description": "dinner"}),
        );
        let snap = record.snapshot();
        assert_eq!(snap["id"], "e1");
        assert_eq!(snap["amount"], 50);
        assert_eq!(snap["deleted"], false);
        assert!(snap["updated_at"].is_string());
    }

    #[test]
    fn test_event_decode_update() {
        let frame = json!({
            "op": "update",
            "table": "expenses",
            "record": {"id": "e1", "amount": 75, "updated_at": "2026-03-01T10:00:00Z"},
            "old_record": {"id": "e1", "amount": 50, "updated_at": "2026-03-01T09:00:00Z"}
        });

        let event = ChangeEvent::from_value(&frame).unwrap();
        assert_eq!(event.op, Operation::Update);
        assert_eq!(event.record_type, RecordType::Expense);
        assert_eq!(event.record_id, "e1");
        assert!(event.snapshot.is_some());
        assert!(event.previous.is_some());
    }

    #[test]
    fn test_event_decode_delete_key_only() {
        let frame = json!({
            "op": "delete",
            "table": "tags",
            "old_record": {"id": "t1"}
        });

        let event = ChangeEvent::from_value(&frame).unwrap();
        assert_eq!(event.op, Operation::Delete);
        assert_eq!(event.record_id, "t1");
        assert!(event.snapshot.is_none());
    }

    #[test]
    fn test_event_decode_rejects_malformed() {
        assert!(matches!(
            ChangeEvent::from_value(&json!("not an object")),
            Err(EventDecodeError::NotAnObject)
        ));
        assert!(matches!(
            ChangeEvent::from_value(&json!({"table": "expenses"})),
            Err(EventDecodeError::MissingField("op"))
        ));
        assert!(matches!(
            ChangeEvent::from_value(&json!({"op": "upsert", "table": "expenses"})),
            Err(EventDecodeError::UnknownOperation(_))
        ));
        assert!(matches!(
            ChangeEvent::from_value(&json!({"op": "update", "table": "widgets"})),
            Err(EventDecodeError::UnknownTable(_))
        ));
        assert!(matches!(
            ChangeEvent::from_value(&json!({
                "op": "update",
                "table": "expenses",
                "record": {"id": "e1", "updated_at": "yesterday"}
            })),
            Err(EventDecodeError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_event_decode_update_requires_timestamp() {
        let frame = json!({
            "op": "update",
            "table": "expenses",
            "record": {"id": "e1", "amount": 75}
        });
        assert!(matches!(
            ChangeEvent::from_value(&frame),
            Err(EventDecodeError::MissingField("record.updated_at"))
        ));
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert!(config.auto_sync);
        assert!(config.pull_on_sync);
        assert!(!config.device_id.is_empty());
        assert!(!config.device_name.is_empty());
    }
}
