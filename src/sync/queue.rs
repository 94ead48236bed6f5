//! Outbound Sync Queue
//!
//! Durable, ordered record of local mutations not yet confirmed by the
//! remote store. At most one pending entry exists per record: a new local
//! mutation coalesces into the existing entry (snapshot replaced, sequence
//! number unchanged), which is what prevents duplicate and out-of-order
//! replay of the same record without a global lock.
//!
//! Retry policy: transient failures back off exponentially (base 30s,
//! capped at 1h) and are retried indefinitely; permanent failures are kept
//! with status `failed` for user-visible diagnostics, never retried
//! automatically and never silently dropped.

use crate::db::{Database, DbError, DbResult};
use crate::sync::models::{Operation, RecordType};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

// ============================================================================
// Constants
// ============================================================================

const BASE_DELAY_SECS: i64 = 30; // Initial retry delay
const MAX_DELAY_SECS: i64 = 3600; // Retry delay cap

// ============================================================================
// Data Types
// ============================================================================

/// Queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One durable outbound mutation
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub seq: i64,
    pub record_type: RecordType,
    pub record_id: String,
    pub op: Operation,
    /// Full post-mutation record snapshot
    pub snapshot: Value,
    pub status: EntryStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Next retry timestamp with exponential backoff
    pub fn backoff_from(attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let exp = attempts.clamp(0, 20) as u32;
        let delay_secs = BASE_DELAY_SECS
            .saturating_mul(2_i64.saturating_pow(exp))
            .min(MAX_DELAY_SECS);
        now + Duration::seconds(delay_secs)
    }
}

/// Queue statistics for status surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: i64,
    pub failed_count: i64,
    pub total_count: i64,
}

// ============================================================================
// Outbound Queue
// ============================================================================

/// Manages the durable outbound mutation queue
#[derive(Clone)]
pub struct OutboundQueue {
    db: Arc<Database>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("queue entry not found: {0}")]
    EntryNotFound(i64),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl OutboundQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Enqueue a mutation, coalescing into an existing pending entry.
    ///
    /// Coalescing keeps the original sequence number (per-record ordering)
    /// and resets the retry clock: a coalesced mutation is fresh intent.
    /// Op folding: a delete always wins; an entry the remote has never
    /// seen stays a create; otherwise the newer op replaces the older.
    pub fn enqueue(
        &self,
        record_type: RecordType,
        record_id: &str,
        op: Operation,
        snapshot: &Value,
    ) -> Result<i64, QueueError> {
        let snapshot_json = serde_json::to_string(snapshot)
            .map_err(|e| QueueError::InvalidSnapshot(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.db.get_conn().map_err(DbError::from)?;
        let tx = conn.transaction().map_err(DbError::from)?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, op FROM sync_queue \
                 WHERE record_type = ?1 AND record_id = ?2 AND status = 'pending'",
                params![record_type.as_str(), record_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(DbError::from)?;

        let seq = match existing {
            Some((seq, existing_op)) => {
                let folded = fold_op(Operation::from_str(&existing_op), op);
                tx.execute(
                    "UPDATE sync_queue \
                     SET op = ?1, snapshot = ?2, attempts = 0, last_error = NULL, \
                         next_retry_at = NULL, updated_at = ?3 \
                     WHERE seq = ?4",
                    params![folded.as_str(), snapshot_json, now, seq],
                )
                .map_err(DbError::from)?;
                log::debug!(
                    "Coalesced {} {}/{} into queue entry {}",
                    folded.as_str(),
                    record_type.as_str(),
                    record_id,
                    seq
                );
                seq
            }
            None => {
                tx.execute(
                    "INSERT INTO sync_queue \
                     (record_type, record_id, op, snapshot, status, attempts, \
                      created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
                    params![
                        record_type.as_str(),
                        record_id,
                        op.as_str(),
                        snapshot_json,
                        now
                    ],
                )
                .map_err(DbError::from)?;
                let seq = tx.last_insert_rowid();
                log::debug!(
                    "Queued {} {}/{} as entry {}",
                    op.as_str(),
                    record_type.as_str(),
                    record_id,
                    seq
                );
                seq
            }
        };

        tx.commit().map_err(DbError::from)?;
        Ok(seq)
    }

    /// Non-destructive snapshot of pending entries ready to push, in
    /// sequence order. Entries still backing off are excluded.
    pub fn drain(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let now = Utc::now().to_rfc3339();
        let entries = self.db.query(
            "SELECT seq, record_type, record_id, op, snapshot, status, attempts, \
                    last_error, next_retry_at, created_at, updated_at \
             FROM sync_queue \
             WHERE status = 'pending' \
               AND (next_retry_at IS NULL OR next_retry_at <= ?1) \
             ORDER BY seq ASC",
            params![now],
            map_entry,
        )?;
        Ok(entries)
    }

    /// The pending entry for one record, if any
    pub fn pending_entry(
        &self,
        record_type: RecordType,
        record_id: &str,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let entries = self.db.query(
            "SELECT seq, record_type, record_id, op, snapshot, status, attempts, \
                    last_error, next_retry_at, created_at, updated_at \
             FROM sync_queue \
             WHERE record_type = ?1 AND record_id = ?2 AND status = 'pending'",
            params![record_type.as_str(), record_id],
            map_entry,
        )?;
        Ok(entries.into_iter().next())
    }

    /// Fetch an entry by sequence number
    pub fn get(&self, seq: i64) -> Result<QueueEntry, QueueError> {
        let entries = self.db.query(
            "SELECT seq, record_type, record_id, op, snapshot, status, attempts, \
                    last_error, next_retry_at, created_at, updated_at \
             FROM sync_queue WHERE seq = ?1",
            params![seq],
            map_entry,
        )?;
        entries
            .into_iter()
            .next()
            .ok_or(QueueError::EntryNotFound(seq))
    }

    /// Remote acknowledged a pushed snapshot: remove the entry, but only
    /// if it still carries that snapshot. A mutation that coalesced in
    /// while the push was in flight bumps `updated_at`, so the entry
    /// survives here and goes out on the next pass. Returns whether the
    /// entry was removed.
    pub fn mark_succeeded(&self, seq: i64, pushed_at: DateTime<Utc>) -> Result<bool, QueueError> {
        let affected = self.db.execute(
            "DELETE FROM sync_queue WHERE seq = ?1 AND updated_at = ?2",
            params![seq, pushed_at.to_rfc3339()],
        )?;
        if affected > 0 {
            log::debug!("Queue entry {} acknowledged", seq);
        } else {
            log::info!(
                "Queue entry {} coalesced during push, keeping newer snapshot",
                seq
            );
        }
        Ok(affected > 0)
    }

    /// Transient failure: schedule a retry with exponential backoff
    pub fn mark_transient_failure(&self, seq: i64, error: &str) -> Result<(), QueueError> {
        let entry = self.get(seq)?;
        let attempts = entry.attempts + 1;
        let next_retry = QueueEntry::backoff_from(entry.attempts, Utc::now());

        self.db.execute(
            "UPDATE sync_queue \
             SET attempts = ?1, last_error = ?2, next_retry_at = ?3, updated_at = ?4 \
             WHERE seq = ?5",
            params![
                attempts,
                error,
                next_retry.to_rfc3339(),
                Utc::now().to_rfc3339(),
                seq
            ],
        )?;

        log::warn!(
            "Queue entry {} transient failure (attempt {}), retrying at {}: {}",
            seq,
            attempts,
            next_retry,
            error
        );
        Ok(())
    }

    /// Permanent failure: stop retrying, keep the entry for diagnostics
    pub fn mark_failed(&self, seq: i64, error: &str) -> Result<(), QueueError> {
        let affected = self.db.execute(
            "UPDATE sync_queue \
             SET status = 'failed', last_error = ?1, next_retry_at = NULL, updated_at = ?2 \
             WHERE seq = ?3",
            params![error, Utc::now().to_rfc3339(), seq],
        )?;
        if affected == 0 {
            return Err(QueueError::EntryNotFound(seq));
        }
        log::error!("Queue entry {} permanently failed: {}", seq, error);
        Ok(())
    }

    /// Drop the pending entry for a record that a newer remote change has
    /// superseded. Resending it would resurrect an overwritten state.
    pub fn discard(&self, record_type: RecordType, record_id: &str) -> Result<bool, QueueError> {
        let affected = self.db.execute(
            "DELETE FROM sync_queue \
             WHERE record_type = ?1 AND record_id = ?2 AND status = 'pending'",
            params![record_type.as_str(), record_id],
        )?;
        if affected > 0 {
            log::info!(
                "Discarded superseded queue entry for {}/{}",
                record_type.as_str(),
                record_id
            );
        }
        Ok(affected > 0)
    }

    /// Queue statistics
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let stats = self.db.query_row(
            "SELECT \
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), \
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), \
                COUNT(*) \
             FROM sync_queue",
            [],
            |row| {
                Ok(QueueStats {
                    pending_count: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                    failed_count: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    total_count: row.get(2)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// All permanently failed entries, for user-visible diagnostics
    pub fn failed_entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let entries = self.db.query(
            "SELECT seq, record_type, record_id, op, snapshot, status, attempts, \
                    last_error, next_retry_at, created_at, updated_at \
             FROM sync_queue WHERE status = 'failed' ORDER BY seq ASC",
            [],
            map_entry,
        )?;
        Ok(entries)
    }

    /// Reset failed entries for a user-initiated retry
    pub fn retry_failed(&self) -> Result<i64, QueueError> {
        let updated = self.db.execute(
            "UPDATE sync_queue \
             SET status = 'pending', attempts = 0, last_error = NULL, \
                 next_retry_at = NULL, updated_at = ?1 \
             WHERE status = 'failed'",
            params![Utc::now().to_rfc3339()],
        )?;
        log::info!("Reset {} failed queue entries for retry", updated);
        Ok(updated as i64)
    }

    /// Remove failed entries the user has dismissed
    pub fn clear_failed(&self) -> Result<i64, QueueError> {
        let deleted = self
            .db
            .execute("DELETE FROM sync_queue WHERE status = 'failed'", [])?;
        log::info!("Cleared {} failed queue entries", deleted);
        Ok(deleted as i64)
    }
}

/// Coalescing rule for operation kinds
fn fold_op(existing: Option<Operation>, new: Operation) -> Operation {
    match (existing, new) {
        // Deletion always dominates the queued intent
        (_, Operation::Delete) => Operation::Delete,
        // The remote has never seen this record, so it is still a create
        (Some(Operation::Create), _) => Operation::Create,
        _ => new,
    }
}

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let type_str: String = row.get(1)?;
    let op_str: String = row.get(3)?;
    let snapshot_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;

    let parse_ts = |s: String| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| rusqlite::Error::InvalidQuery)
    };

    Ok(QueueEntry {
        seq: row.get(0)?,
        record_type: RecordType::from_str(&type_str).ok_or(rusqlite::Error::InvalidQuery)?,
        record_id: row.get(2)?,
        op: Operation::from_str(&op_str).ok_or(rusqlite::Error::InvalidQuery)?,
        snapshot: serde_json::from_str(&snapshot_str)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        status: EntryStatus::from_str(&status_str),
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        next_retry_at: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        created_at: parse_ts(row.get(9)?)?,
        updated_at: parse_ts(row.get(10)?)?,
    })
}

// ============================================================================
// Tests
// ============================================================================
