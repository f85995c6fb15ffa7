//! Access to the primary store: the appliance's operational database,
//! shared with the unrelated web application (spec §3 "Ownership",
//! §4.6). The engine reads/writes rows under a documented per-table
//! schema it never creates.
//!
//! Remote rows arrive as arbitrary key→value maps (`serde_json::Value`
//! already is the tagged-scalar-plus-null variant spec §9 asks for), so
//! the apply layer generates parameterised SQL at runtime from the row's
//! key set rather than from a compiled-in schema.

use crate::error::{Result, SyncError};
use rusqlite::{types::ToSqlOutput, Connection, ToSql};
use serde_json::Value;
use std::path::Path;

fn row_object(row: &Value) -> Result<&serde_json::Map<String, Value>> {
    row.as_object().ok_or_else(|| {
        SyncError::SchemaMismatch("row payload is not a JSON object".to_string())
    })
}

fn insert_on(conn: &Connection, table: &str, row: &Value) -> Result<()> {
    let obj = row_object(row)?;
    if obj.is_empty() {
        return Err(SyncError::SchemaMismatch(format!(
            "empty row payload for table {table}"
        )));
    }
    let columns: Vec<&String> = obj.keys().collect();
    let col_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({col_list}) VALUES ({placeholders})",
        quote_ident(table)
    );
    let params: Vec<JsonScalar> = columns.iter().map(|c| JsonScalar(&obj[*c])).collect();
    let params_ref: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    conn.execute(&sql, params_ref.as_slice())
        .map_err(|e| SyncError::SchemaMismatch(format!("insert into {table}: {e}")))?;
    Ok(())
}

fn update_by_id_on(conn: &Connection, table: &str, id: &str, row: &Value) -> Result<bool> {
    let obj = row_object(row)?;
    let columns: Vec<&String> = obj.keys().filter(|k| k.as_str() != "id").collect();
    if columns.is_empty() {
        return Ok(true);
    }
    let set_clause = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {set_clause} WHERE id = ?{}",
        quote_ident(table),
        columns.len() + 1
    );
    let mut params: Vec<JsonScalar> = columns.iter().map(|c| JsonScalar(&obj[*c])).collect();
    let id_value = Value::String(id.to_string());
    params.push(JsonScalar(&id_value));
    let params_ref: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    let affected = conn
        .execute(&sql, params_ref.as_slice())
        .map_err(|e| SyncError::SchemaMismatch(format!("update {table}: {e}")))?;
    Ok(affected > 0)
}

fn delete_by_id_on(conn: &Connection, table: &str, id: &str) -> Result<()> {
    let sql = format!("DELETE FROM {} WHERE id = ?1", quote_ident(table));
    conn.execute(&sql, [id])
        .map_err(|e| SyncError::SchemaMismatch(format!("delete from {table}: {e}")))?;
    Ok(())
}

fn sql_value_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

/// Fetch the row identified by `id` in `table` as a JSON object, or `None`
/// if no such row or no `id` column exists (spec §4.6 merge path needs the
/// current local row to compute a field-wise union against the remote).
fn get_by_id_on(conn: &Connection, table: &str, id: &str) -> Result<Option<Value>> {
    let sql = format!("SELECT * FROM {} WHERE id = ?1", quote_ident(table));
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| SyncError::SchemaMismatch(format!("select from {table}: {e}")))?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt
        .query([id])
        .map_err(|e| SyncError::SchemaMismatch(format!("select from {table}: {e}")))?;
    match rows
        .next()
        .map_err(|e| SyncError::SchemaMismatch(format!("select from {table}: {e}")))?
    {
        Some(row) => {
            let mut obj = serde_json::Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let value = row
                    .get_ref(i)
                    .map_err(|e| SyncError::SchemaMismatch(format!("select from {table}: {e}")))?;
                obj.insert(name.clone(), sql_value_to_json(value));
            }
            Ok(Some(Value::Object(obj)))
        }
        None => Ok(None),
    }
}

/// Tables imported during bootstrap, in dependency order so referential
/// integrity holds (spec §4.6 `initial_sync`).
pub const INITIAL_SYNC_TABLE_ORDER: &[&str] = &[
    "users",
    "roles",
    "permissions",
    "contacts",
    "resources",
    "logbook_entries",
    "wiki_articles",
    "scenarios",
    "checklists",
];

pub struct PrimaryStore {
    conn: Connection,
}

/// Wrap a `serde_json::Value` scalar so it implements `ToSql`. Arrays and
/// nested objects are passed through as their JSON text representation —
/// the primary schema's columns are expected to hold scalars.
struct JsonScalar<'a>(&'a Value);

impl ToSql for JsonScalar<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as SqlValue;
        let value = match self.0 {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(*b as i64),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    SqlValue::Real(f)
                } else {
                    SqlValue::Null
                }
            }
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => SqlValue::Text(self.0.to_string()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl PrimaryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Insert `row` into `table` using the full payload as the column set.
    pub fn insert(&self, table: &str, row: &Value) -> Result<()> {
        insert_on(&self.conn, table, row)
    }

    /// Update the row identified by `id` in `table`. Returns `true` if a
    /// row was matched, `false` if zero rows matched (caller falls back
    /// to `insert`, per spec §4.6).
    pub fn update_by_id(&self, table: &str, id: &str, row: &Value) -> Result<bool> {
        update_by_id_on(&self.conn, table, id, row)
    }

    /// Insert-or-update by `id`: update first, insert on a zero-row match.
    /// Applying the same INSERT twice through this path converges to the
    /// same state (spec §8 idempotence law).
    pub fn upsert(&self, table: &str, row: &Value) -> Result<()> {
        let obj = row_object(row)?;
        match obj.get("id").and_then(|v| v.as_str()) {
            Some(id) => {
                if !self.update_by_id(table, id, row)? {
                    self.insert(table, row)?;
                }
            }
            None => self.insert(table, row)?,
        }
        Ok(())
    }

    /// Delete the row identified by `id` in `table`.
    pub fn delete_by_id(&self, table: &str, id: &str) -> Result<()> {
        delete_by_id_on(&self.conn, table, id)
    }

    /// Fetch the row identified by `id` in `table` as a JSON object.
    pub fn get_by_id(&self, table: &str, id: &str) -> Result<Option<Value>> {
        get_by_id_on(&self.conn, table, id)
    }

    /// Run `f` inside a single transaction on the primary store.
    pub fn with_tx<R>(
        &mut self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let tx = self.conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Insert `row` using an already-open transaction (reconciler apply
    /// path, spec §4.6). `Transaction` derefs to `Connection`.
    pub fn insert_tx(tx: &rusqlite::Transaction<'_>, table: &str, row: &Value) -> Result<()> {
        insert_on(tx, table, row)
    }

    /// Update-by-id using an already-open transaction; same fallback
    /// contract as `update_by_id`.
    pub fn update_by_id_tx(
        tx: &rusqlite::Transaction<'_>,
        table: &str,
        id: &str,
        row: &Value,
    ) -> Result<bool> {
        update_by_id_on(tx, table, id, row)
    }

    /// Delete-by-id using an already-open transaction.
    pub fn delete_by_id_tx(tx: &rusqlite::Transaction<'_>, table: &str, id: &str) -> Result<()> {
        delete_by_id_on(tx, table, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> PrimaryStore {
        let store = PrimaryStore::open_in_memory().unwrap();
        store
            .conn
            .execute_batch("CREATE TABLE contacts (id TEXT PRIMARY KEY, name TEXT);")
            .unwrap();
        store
    }

    #[test]
    fn insert_then_select() {
        let store = setup();
        store
            .insert("contacts", &json!({"id": "c1", "name": "A"}))
            .unwrap();
        let name: String = store
            .conn
            .query_row("SELECT name FROM contacts WHERE id = 'c1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "A");
    }

    #[test]
    fn update_by_id_falls_back_to_insert_on_zero_rows() {
        let store = setup();
        let updated = store
            .update_by_id("contacts", "missing", &json!({"id": "missing", "name": "X"}))
            .unwrap();
        assert!(!updated);
        store
            .upsert("contacts", &json!({"id": "missing", "name": "X"}))
            .unwrap();
        let name: String = store
            .conn
            .query_row("SELECT name FROM contacts WHERE id = 'missing'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "X");
    }

    #[test]
    fn applying_same_insert_twice_converges_same_state() {
        let store = setup();
        store.upsert("contacts", &json!({"id": "c1", "name": "A"})).unwrap();
        store.upsert("contacts", &json!({"id": "c1", "name": "A"})).unwrap();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM contacts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn delete_removes_row() {
        let store = setup();
        store.insert("contacts", &json!({"id": "c1", "name": "A"})).unwrap();
        store.delete_by_id("contacts", "c1").unwrap();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM contacts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
