//! Metadata store: the embedded relational database owned exclusively by
//! the sync engine, holding the change log, sync-session history, and
//! conflict log (spec §3, §4.3).
//!
//! Schema layout and the transaction-per-write-operation style are
//! carried from the teacher's `SyncEngine` in the original oplog module.

use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Operation {
        match s {
            "INSERT" => Operation::Insert,
            "DELETE" => Operation::Delete,
            _ => Operation::Update,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub seq: i64,
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub changed_at: DateTime<Utc>,
    pub synced: bool,
    pub sync_id: Option<String>,
    pub data_hash: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Error,
}

impl SyncStatus {
    fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> SyncStatus {
        match s {
            "completed" => SyncStatus::Completed,
            "failed" => SyncStatus::Failed,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Push,
    Pull,
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSession {
    pub sync_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub direction: SyncDirection,
    pub records_sent: i64,
    pub records_received: i64,
    pub conflicts: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    LocalWins,
    RemoteWins,
    Merged,
}

impl ConflictResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictResolution::LocalWins => "local_wins",
            ConflictResolution::RemoteWins => "remote_wins",
            ConflictResolution::Merged => "merged",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub sync_id: String,
    pub table_name: String,
    pub record_id: String,
    pub local_data: serde_json::Value,
    pub remote_data: serde_json::Value,
    pub resolution: ConflictResolution,
    pub resolved_at: DateTime<Utc>,
    pub resolved_by: String,
}

/// The embedded metadata database. One connection, guarded by a mutex so
/// writes are serialised per spec §4.3/§5.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS change_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    operation TEXT NOT NULL CHECK(operation IN ('INSERT','UPDATE','DELETE')),
    changed_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    sync_id TEXT,
    data_hash TEXT NOT NULL,
    data TEXT
);

CREATE INDEX IF NOT EXISTS idx_change_log_pending
ON change_log(synced, seq);

CREATE INDEX IF NOT EXISTS idx_change_log_record
ON change_log(table_name, record_id, synced);

CREATE TABLE IF NOT EXISTS sync_sessions (
    sync_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    direction TEXT NOT NULL,
    records_sent INTEGER NOT NULL DEFAULT 0,
    records_received INTEGER NOT NULL DEFAULT 0,
    conflicts INTEGER NOT NULL DEFAULT 0,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_sessions_completed
ON sync_sessions(status, completed_at);

CREATE TABLE IF NOT EXISTS conflict_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sync_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    local_data TEXT NOT NULL,
    remote_data TEXT NOT NULL,
    resolution TEXT NOT NULL,
    resolved_at TEXT NOT NULL,
    resolved_by TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_kv (
    k TEXT PRIMARY KEY,
    v TEXT NOT NULL
);
"#,
        )?;
        Ok(())
    }

    // ---- change log -----------------------------------------------------

    /// Append a `ChangeEntry`. Never drops an entry silently: failures
    /// surface as `StoreUnavailable`-convertible `SyncError`s.
    pub fn track_change(
        &self,
        table_name: &str,
        record_id: &str,
        operation: Operation,
        data: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let data_hash = match (operation, data) {
            (Operation::Delete, _) => String::new(),
            (_, Some(payload)) => crate::canonical::hash_payload(payload),
            (_, None) => String::new(),
        };
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        conn.execute(
            "INSERT INTO change_log (table_name, record_id, operation, changed_at, synced, data_hash, data)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![
                table_name,
                record_id,
                operation.as_str(),
                Utc::now().to_rfc3339(),
                data_hash,
                data.map(|d| d.to_string()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The oldest `limit` unsynced entries, ordered by `seq` ascending.
    pub fn pending(&self, limit: i64) -> Result<Vec<ChangeEntry>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT seq, table_name, record_id, operation, changed_at, synced, sync_id, data_hash, data
             FROM change_log
             WHERE synced = 0
             ORDER BY seq ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_change_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Mark every listed entry as synced, atomically.
    pub fn mark_synced(&self, entries: &[ChangeEntry], sync_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().expect("metadata store mutex poisoned");
        let tx = conn.transaction()?;
        for entry in entries {
            tx.execute(
                "UPDATE change_log SET synced = 1, sync_id = ?1 WHERE seq = ?2",
                params![sync_id, entry.seq],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// True iff an unsynced local change exists for `(table_name, record_id)`.
    pub fn has_unsynced_change(&self, table_name: &str, record_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM change_log WHERE table_name = ?1 AND record_id = ?2 AND synced = 0 LIMIT 1",
                params![table_name, record_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ---- sync sessions ---------------------------------------------------

    pub fn start_session(&self, sync_id: &str, direction: SyncDirection) -> Result<()> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        conn.execute(
            "INSERT INTO sync_sessions (sync_id, started_at, status, direction, records_sent, records_received, conflicts)
             VALUES (?1, ?2, 'running', ?3, 0, 0, 0)",
            params![sync_id, Utc::now().to_rfc3339(), direction.as_str()],
        )?;
        Ok(())
    }

    pub fn complete_session(
        &self,
        sync_id: &str,
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        conn.execute(
            "UPDATE sync_sessions SET completed_at = ?1, status = ?2, error = ?3 WHERE sync_id = ?4",
            params![Utc::now().to_rfc3339(), status.as_str(), error, sync_id],
        )?;
        Ok(())
    }

    pub fn increment_records_sent(&self, sync_id: &str, amount: i64) -> Result<()> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        conn.execute(
            "UPDATE sync_sessions SET records_sent = records_sent + ?1 WHERE sync_id = ?2",
            params![amount, sync_id],
        )?;
        Ok(())
    }

    pub fn increment_records_received(&self, sync_id: &str, amount: i64) -> Result<()> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        conn.execute(
            "UPDATE sync_sessions SET records_received = records_received + ?1 WHERE sync_id = ?2",
            params![amount, sync_id],
        )?;
        Ok(())
    }

    pub fn increment_conflicts(&self, sync_id: &str, amount: i64) -> Result<()> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        conn.execute(
            "UPDATE sync_sessions SET conflicts = conflicts + ?1 WHERE sync_id = ?2",
            params![amount, sync_id],
        )?;
        Ok(())
    }

    /// `completed_at` of the most recent `completed` session — there is
    /// only one device per process, so "most recent completed session of
    /// this process" is the right reading of the ambiguous predicate in
    /// the original source (spec §9, Open Question 2).
    pub fn last_completed_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        let raw: Option<String> = conn
            .query_row(
                "SELECT completed_at FROM sync_sessions WHERE status = 'completed' ORDER BY completed_at DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
    }

    pub fn any_session_running(&self) -> Result<bool> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sync_sessions WHERE status = 'running' LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ---- conflict log ------------------------------------------------------

    pub fn record_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        conn.execute(
            "INSERT INTO conflict_log (sync_id, table_name, record_id, local_data, remote_data, resolution, resolved_at, resolved_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                conflict.sync_id,
                conflict.table_name,
                conflict.record_id,
                conflict.local_data.to_string(),
                conflict.remote_data.to_string(),
                conflict.resolution.as_str(),
                conflict.resolved_at.to_rfc3339(),
                conflict.resolved_by,
            ],
        )?;
        Ok(())
    }

    pub fn conflict_count(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("metadata store mutex poisoned");
        conn.query_row("SELECT COUNT(*) FROM conflict_log", [], |r| r.get(0))
            .map_err(Into::into)
    }
}

fn row_to_change_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeEntry> {
    let op_str: String = row.get(3)?;
    let changed_at: String = row.get(4)?;
    let synced: i64 = row.get(5)?;
    let data_raw: Option<String> = row.get(8)?;
    Ok(ChangeEntry {
        seq: row.get(0)?,
        table_name: row.get(1)?,
        record_id: row.get(2)?,
        operation: Operation::parse(&op_str),
        changed_at: DateTime::parse_from_rfc3339(&changed_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        synced: synced != 0,
        sync_id: row.get(6)?,
        data_hash: row.get(7)?,
        data: data_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_limit_zero_returns_empty() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .track_change("contacts", "c1", Operation::Insert, Some(&json!({"id": "c1"})))
            .unwrap();
        assert!(store.pending(0).unwrap().is_empty());
    }

    #[test]
    fn pending_is_ordered_by_seq_and_excludes_synced() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .track_change("contacts", "c1", Operation::Insert, Some(&json!({"id": "c1"})))
            .unwrap();
        store
            .track_change("contacts", "c2", Operation::Insert, Some(&json!({"id": "c2"})))
            .unwrap();

        let pending = store.pending(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].seq < pending[1].seq);

        store.mark_synced(&pending[..1], "sync-1").unwrap();
        let remaining = store.pending(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].record_id, "c2");
    }

    #[test]
    fn data_hash_matches_canonical_json_hash() {
        let store = MetadataStore::open_in_memory().unwrap();
        let payload = json!({"id": "c1", "name": "A"});
        store
            .track_change("contacts", "c1", Operation::Insert, Some(&payload))
            .unwrap();
        let entries = store.pending(10).unwrap();
        assert_eq!(entries[0].data_hash, crate::canonical::hash_payload(&payload));
    }

    #[test]
    fn delete_has_empty_hash() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .track_change("contacts", "c1", Operation::Delete, None)
            .unwrap();
        let entries = store.pending(10).unwrap();
        assert_eq!(entries[0].data_hash, "");
    }

    #[test]
    fn session_lifecycle_tracks_counters() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.start_session("dev-1", SyncDirection::Bidirectional).unwrap();
        assert!(store.any_session_running().unwrap());
        store.increment_records_sent("dev-1", 3).unwrap();
        store.complete_session("dev-1", SyncStatus::Completed, None).unwrap();
        assert!(!store.any_session_running().unwrap());
    }

    #[test]
    fn unsynced_change_is_detected_for_conflict_check() {
        let store = MetadataStore::open_in_memory().unwrap();
        assert!(!store.has_unsynced_change("contacts", "c1").unwrap());
        store
            .track_change("contacts", "c1", Operation::Update, Some(&json!({"name": "AA"})))
            .unwrap();
        assert!(store.has_unsynced_change("contacts", "c1").unwrap());
    }
}
