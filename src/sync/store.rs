//! Local Store Adapter
//!
//! Typed, keyed access to the on-device record table. Every write is a
//! single atomic statement; `upsert_if_newer` is the compare-then-overwrite
//! primitive the last-writer-wins merge relies on, so a concurrent local
//! edit and inbound event for the same record can never interleave their
//! read-modify-write.

use crate::db::{Database, DbError, DbResult};
use crate::sync::models::{Record, RecordType, SyncStatus};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::Value;
use std::sync::Arc;

/// Local record store over the pooled database
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
}

impl LocalStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fetch a record by type and id, including soft-deleted rows
    pub fn get(&self, record_type: RecordType, id: &str) -> DbResult<Option<Record>> {
        let rows = self.db.query(
            "SELECT record_type, id, payload, updated_at, sync_status, deleted \
             FROM records WHERE record_type = ?1 AND id = ?2",
            params![record_type.as_str(), id],
            map_record,
        )?;
        Ok(rows.into_iter().next())
    }

    /// Write a record unconditionally (insert or replace)
    pub fn upsert(&self, record: &Record) -> DbResult<()> {
        let payload = encode_payload(record)?;
        self.db.execute(
            "INSERT INTO records (record_type, id, payload, updated_at, sync_status, deleted) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(record_type, id) DO UPDATE SET \
                payload = excluded.payload, \
                updated_at = excluded.updated_at, \
                sync_status = excluded.sync_status, \
                deleted = excluded.deleted",
            params![
                record.record_type.as_str(),
                record.id,
                payload,
                record.updated_at.to_rfc3339(),
                record.sync_status.as_str(),
                record.deleted as i64
            ],
        )?;
        Ok(())
    }

    /// Write a record only if it is strictly newer than the stored row.
    ///
    /// Returns true when the write was applied (no existing row, or the
    /// incoming `updated_at` is greater). A same-age-or-older write leaves
    /// the row untouched and returns false.
    pub fn upsert_if_newer(&self, record: &Record) -> DbResult<bool> {
        let payload = encode_payload(record)?;
        let affected = self.db.execute(
            "INSERT INTO records (record_type, id, payload, updated_at, sync_status, deleted) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(record_type, id) DO UPDATE SET \
                payload = excluded.payload, \
                updated_at = excluded.updated_at, \
                sync_status = excluded.sync_status, \
                deleted = excluded.deleted \
             WHERE excluded.updated_at > records.updated_at",
            params![
                record.record_type.as_str(),
                record.id,
                payload,
                record.updated_at.to_rfc3339(),
                record.sync_status.as_str(),
                record.deleted as i64
            ],
        )?;
        Ok(affected > 0)
    }

    /// Soft-delete a record, regardless of its current timestamp.
    ///
    /// The row is kept so the deletion itself can propagate and be merged;
    /// `updated_at` only moves forward.
    pub fn soft_delete(
        &self,
        record_type: RecordType,
        id: &str,
        at: DateTime<Utc>,
        status: SyncStatus,
    ) -> DbResult<()> {
        let affected = self.db.execute(
            "UPDATE records SET deleted = 1, sync_status = ?3, \
                updated_at = MAX(updated_at, ?4) \
             WHERE record_type = ?1 AND id = ?2",
            params![
                record_type.as_str(),
                id,
                status.as_str(),
                at.to_rfc3339()
            ],
        )?;
        if affected == 0 {
            return Err(DbError::NotFound(format!(
                "{}/{}",
                record_type.as_str(),
                id
            )));
        }
        Ok(())
    }

    /// Remove a row outright. Used for pure association records and for
    /// rolling back an optimistic create that could not be queued.
    pub fn remove(&self, record_type: RecordType, id: &str) -> DbResult<()> {
        self.db.execute(
            "DELETE FROM records WHERE record_type = ?1 AND id = ?2",
            params![record_type.as_str(), id],
        )?;
        Ok(())
    }

    /// All live records of a type (soft-deleted rows excluded)
    pub fn query(&self, record_type: RecordType) -> DbResult<Vec<Record>> {
        self.db.query(
            "SELECT record_type, id, payload, updated_at, sync_status, deleted \
             FROM records WHERE record_type = ?1 AND deleted = 0 \
             ORDER BY updated_at DESC",
            params![record_type.as_str()],
            map_record,
        )
    }

    /// All records of a type, including soft-deleted rows
    pub fn query_with_deleted(&self, record_type: RecordType) -> DbResult<Vec<Record>> {
        self.db.query(
            "SELECT record_type, id, payload, updated_at, sync_status, deleted \
             FROM records WHERE record_type = ?1 \
             ORDER BY updated_at DESC",
            params![record_type.as_str()],
            map_record,
        )
    }

    /// Live records of a type matching a predicate
    pub fn query_where<F>(&self, record_type: RecordType, predicate: F) -> DbResult<Vec<Record>>
    where
        F: Fn(&Record) -> bool,
    {
        let rows = self.query(record_type)?;
        Ok(rows.into_iter().filter(|r| predicate(r)).collect())
    }

    /// Update only the sync status of a record
    pub fn set_sync_status(
        &self,
        record_type: RecordType,
        id: &str,
        status: SyncStatus,
    ) -> DbResult<()> {
        self.db.execute(
            "UPDATE records SET sync_status = ?3 WHERE record_type = ?1 AND id = ?2",
            params![record_type.as_str(), id, status.as_str()],
        )?;
        Ok(())
    }
}

fn encode_payload(record: &Record) -> DbResult<String> {
    serde_json::to_string(&record.payload).map_err(|e| DbError::Serialization(e.to_string()))
}

fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let type_str: String = row.get(0)?;
    let payload_str: String = row.get(2)?;
    let updated_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;

    let record_type =
        RecordType::from_str(&type_str).ok_or(rusqlite::Error::InvalidQuery)?;
    let payload: Value =
        serde_json::from_str(&payload_str).map_err(|_| rusqlite::Error::InvalidQuery)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)?;

    Ok(Record {
        record_type,
        id: row.get(1)?,
        payload,
        updated_at,
        sync_status: SyncStatus::from_str(&status_str),
        deleted: row.get::<_, i64>(5)? != 0,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn test_store() -> LocalStore {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        LocalStore::new(db)
    }

    fn expense(id: &str, amount: i64) -> Record {
        Record::new(
            RecordType::Expense,
            id.to_string(),
            json!({"amount": amount, "description": "test"}),
        )
    }

    #[test]
    fn test_upsert_and_get() {
        let store = test_store();
        let record = expense("e1", 50);

        store.upsert(&record).unwrap();

        let fetched = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert_eq!(fetched.id, "e1");
        assert_eq!(fetched.payload["amount"], 50);
        assert_eq!(fetched.sync_status, SyncStatus::Pending);
        assert!(!fetched.deleted);
    }

    #[test]
    fn test_get_missing() {
        let store = test_store();
        assert!(store.get(RecordType::Expense, "nope").unwrap().is_none());
    }

    #[test]
    fn test_upsert_if_newer_accepts_newer() {
        let store = test_store();
        let old = expense("e1", 50);
        store.upsert(&old).unwrap();

        let mut newer = expense("e1", 75);
        newer.updated_at = old.updated_at + Duration::seconds(10);
        newer.sync_status = SyncStatus::Synced;

        assert!(store.upsert_if_newer(&newer).unwrap());
        let fetched = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert_eq!(fetched.payload["amount"], 75);
        assert_eq!(fetched.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_upsert_if_newer_rejects_same_age_and_older() {
        let store = test_store();
        let current = expense("e1", 50);
        store.upsert(&current).unwrap();

        let mut same_age = expense("e1", 99);
        same_age.updated_at = current.updated_at;
        assert!(!store.upsert_if_newer(&same_age).unwrap());

        let mut older = expense("e1", 99);
        older.updated_at = current.updated_at - Duration::seconds(10);
        assert!(!store.upsert_if_newer(&older).unwrap());

        let fetched = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert_eq!(fetched.payload["amount"], 50);
    }

    #[test]
    fn test_upsert_if_newer_inserts_when_absent() {
        let store = test_store();
        assert!(store.upsert_if_newer(&expense("e1", 50)).unwrap());
    }

    #[test]
    fn test_soft_delete_excluded_from_query() {
        let store = test_store();
        store.upsert(&expense("e1", 50)).unwrap();
        store.upsert(&expense("e2", 20)).unwrap();

        store
            .soft_delete(RecordType::Expense, "e1", Utc::now(), SyncStatus::Synced)
            .unwrap();

        let live = store.query(RecordType::Expense).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "e2");

        let all = store.query_with_deleted(RecordType::Expense).unwrap();
        assert_eq!(all.len(), 2);

        // The row survives with its flag set
        let deleted = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_soft_delete_missing_record() {
        let store = test_store();
        let result = store.soft_delete(RecordType::Expense, "nope", Utc::now(), SyncStatus::Synced);
        assert!(matches!(result, Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_soft_delete_never_rewinds_timestamp() {
        let store = test_store();
        let record = expense("e1", 50);
        store.upsert(&record).unwrap();

        let earlier = record.updated_at - Duration::seconds(60);
        store
            .soft_delete(RecordType::Expense, "e1", earlier, SyncStatus::Synced)
            .unwrap();

        let fetched = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert!(fetched.deleted);
        assert!(fetched.updated_at >= record.updated_at - Duration::seconds(1));
    }

    #[test]
    fn test_remove() {
        let store = test_store();
        let link = Record::new(
            RecordType::ParticipantLink,
            "l1".into(),
            json!({"expense_id": "e1", "participant_id": "p1"}),
        );
        store.upsert(&link).unwrap();

        store.remove(RecordType::ParticipantLink, "l1").unwrap();
        assert!(store.get(RecordType::ParticipantLink, "l1").unwrap().is_none());
    }

    #[test]
    fn test_query_where() {
        let store = test_store();
        store.upsert(&expense("e1", 50)).unwrap();
        store.upsert(&expense("e2", 200)).unwrap();

        let large = store
            .query_where(RecordType::Expense, |r| {
                r.payload["amount"].as_i64().unwrap_or(0) > 100
            })
            .unwrap();
        assert_eq!(large.len(), 1);
        assert_eq!(large[0].id, "e2");
    }

    #[test]
    fn test_set_sync_status() {
        let store = test_store();
        store.upsert(&expense("e1", 50)).unwrap();

        store
            .set_sync_status(RecordType::Expense, "e1", SyncStatus::Synced)
            .unwrap();
        let fetched = store.get(RecordType::Expense, "e1").unwrap().unwrap();
        assert_eq!(fetched.sync_status, SyncStatus::Synced);
    }
}
