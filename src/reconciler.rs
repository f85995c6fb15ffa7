//! Reconciler: orchestrates push, pull, initial bootstrap, conflict
//! detection, conflict resolution, and atomic application to the primary
//! store (spec §4.6). This is the core of the engine.

use crate::change_tracker::ChangeTracker;
use crate::config::{ConflictResolutionPolicy, EngineConfig};
use crate::error::{Result, SyncError};
use crate::license::LicenseStore;
use crate::metadata_store::{
    ConflictRecord, ConflictResolution, MetadataStore, Operation, SyncDirection, SyncStatus,
};
use crate::primary_store::{PrimaryStore, INITIAL_SYNC_TABLE_ORDER};
use crate::transport::{SyncTransport, Transport};
use chrono::Utc;
use serde_json::Value;
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Push,
    Pull,
    Bidirectional,
}

impl SyncMode {
    fn direction(self) -> SyncDirection {
        match self {
            SyncMode::Push => SyncDirection::Push,
            SyncMode::Pull => SyncDirection::Pull,
            SyncMode::Bidirectional => SyncDirection::Bidirectional,
        }
    }

    fn pushes(self) -> bool {
        matches!(self, SyncMode::Push | SyncMode::Bidirectional)
    }

    fn pulls(self) -> bool {
        matches!(self, SyncMode::Pull | SyncMode::Bidirectional)
    }
}

#[derive(Debug, Default, Clone)]
pub struct InitialSyncReport {
    pub tables: Vec<TableImportReport>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct TableImportReport {
    pub table_name: String,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

pub struct Reconciler {
    device_id: String,
    metadata: MetadataStore,
    primary: Mutex<PrimaryStore>,
    transport: Box<dyn SyncTransport>,
    license: LicenseStore,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(
        device_id: String,
        metadata: MetadataStore,
        primary: PrimaryStore,
        transport: Transport,
        license: LicenseStore,
        config: EngineConfig,
    ) -> Self {
        Self::with_transport(device_id, metadata, primary, Box::new(transport), license, config)
    }

    /// Construct with an arbitrary transport implementation — used in
    /// scenario tests to swap in a fake that never opens a socket.
    pub fn with_transport(
        device_id: String,
        metadata: MetadataStore,
        primary: PrimaryStore,
        transport: Box<dyn SyncTransport>,
        license: LicenseStore,
        config: EngineConfig,
    ) -> Self {
        Self {
            device_id,
            metadata,
            primary: Mutex::new(primary),
            transport,
            license,
            config,
        }
    }

    fn bearer(&self) -> String {
        let license_key = self
            .license
            .sync_config()
            .license_key
            .unwrap_or_default();
        Transport::bearer_token(&license_key, &self.device_id)
    }

    /// Main entry point: spec §4.6 step 1-5.
    pub fn sync(&self, mode: SyncMode) -> Result<()> {
        if !self.license.is_valid() {
            return Err(SyncError::LicenseInvalid);
        }
        let sync_config = self.license.sync_config();
        if !sync_config.enabled {
            return Err(SyncError::FeatureDisabled);
        }

        let sync_id = format!("{}-{}", self.device_id, Utc::now().timestamp());
        self.metadata.start_session(&sync_id, mode.direction())?;
        info!(sync_id = %sync_id, mode = ?mode, "starting sync session");

        let outcome = (|| -> Result<()> {
            if mode.pushes() {
                self.push(&sync_id)?;
            }
            if mode.pulls() {
                self.pull(&sync_id)?;
            }
            Ok(())
        })();

        match &outcome {
            Ok(()) => {
                self.metadata
                    .complete_session(&sync_id, SyncStatus::Completed, None)?;
                info!(sync_id = %sync_id, "sync session completed");
            }
            Err(err) => {
                self.metadata
                    .complete_session(&sync_id, SyncStatus::Failed, Some(&err.to_string()))?;
                error!(sync_id = %sync_id, error = %err, "sync session failed");
            }
        }

        outcome
    }

    /// Push pending local changes (spec §4.6).
    fn push(&self, sync_id: &str) -> Result<()> {
        let tracker = ChangeTracker::new(&self.metadata);
        let batch = tracker.pending(self.config.batch_size)?;
        if batch.is_empty() {
            info!(sync_id = %sync_id, "no pending changes to push");
            return Ok(());
        }

        let changes: Vec<Value> = batch
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "seq": entry.seq,
                    "table_name": entry.table_name,
                    "record_id": entry.record_id,
                    "operation": entry.operation.as_str(),
                    "data_hash": entry.data_hash,
                    "data": entry.data,
                })
            })
            .collect();

        let body = serde_json::json!({
            "device_id": self.device_id,
            "sync_id": sync_id,
            "changes": changes,
            "timestamp": Utc::now().to_rfc3339(),
        });

        let bearer = self.bearer();
        self.transport
            .push(&self.device_id, sync_id, &bearer, self.config.compression, &body)?;

        tracker.mark_synced(&batch, sync_id)?;
        self.metadata
            .increment_records_sent(sync_id, batch.len() as i64)?;
        info!(sync_id = %sync_id, count = batch.len(), "push succeeded");
        Ok(())
    }

    /// Pull remote changes and apply them (spec §4.6).
    fn pull(&self, sync_id: &str) -> Result<()> {
        let since = self
            .metadata
            .last_completed_sync_at()?
            .map(|d| d.to_rfc3339());
        let bearer = self.bearer();

        let response = self.transport.pull(
            &self.device_id,
            sync_id,
            &bearer,
            since.as_deref(),
            self.config.batch_size,
        )?;

        let changes = response
            .get("changes")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        if changes.is_empty() {
            info!(sync_id = %sync_id, "pull returned no changes");
            return Ok(());
        }

        let mut applied = 0i64;
        let mut conflicting = Vec::new();

        for change in &changes {
            let table_name = change
                .get("table_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| SyncError::SchemaMismatch("missing table_name".to_string()))?;
            let record_id = change
                .get("record_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| SyncError::SchemaMismatch("missing record_id".to_string()))?;

            if self.metadata.has_unsynced_change(table_name, record_id)? {
                conflicting.push(change.clone());
                continue;
            }

            match self.apply_remote_change(change) {
                Ok(()) => applied += 1,
                Err(SyncError::SchemaMismatch(reason)) => {
                    warn!(sync_id = %sync_id, table = table_name, record_id, reason = %reason, "skipping row: schema mismatch");
                }
                Err(other) => return Err(other),
            }
        }

        self.metadata.increment_records_received(sync_id, applied)?;

        if !conflicting.is_empty() {
            self.metadata
                .increment_conflicts(sync_id, conflicting.len() as i64)?;
            self.resolve_conflicts(sync_id, &conflicting)?;
        }

        info!(
            sync_id = %sync_id,
            applied,
            conflicts = conflicting.len(),
            "pull applied remote changes"
        );
        Ok(())
    }

    fn apply_remote_change(&self, change: &Value) -> Result<()> {
        let table_name = change
            .get("table_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::SchemaMismatch("missing table_name".to_string()))?;
        let record_id = change
            .get("record_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::SchemaMismatch("missing record_id".to_string()))?;
        let operation = change
            .get("operation")
            .and_then(|v| v.as_str())
            .map(Operation::parse)
            .ok_or_else(|| SyncError::SchemaMismatch("missing operation".to_string()))?;
        let data = change.get("data").cloned().unwrap_or(Value::Null);

        let mut primary = self.primary.lock().expect("primary store mutex poisoned");
        primary.with_tx(|tx| {
            match operation {
                Operation::Insert => apply_insert(tx, table_name, &data)?,
                Operation::Update => apply_update_or_insert(tx, table_name, record_id, &data)?,
                Operation::Delete => apply_delete(tx, table_name, record_id)?,
            }
            Ok(())
        })
    }

    /// Resolve conflicts per spec §4.6 / §9 Open Question 3.
    fn resolve_conflicts(&self, sync_id: &str, conflicts: &[Value]) -> Result<()> {
        for change in conflicts {
            let table_name = change
                .get("table_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let record_id = change
                .get("record_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let remote_data = change.get("data").cloned().unwrap_or(Value::Null);
            let local_data = {
                let primary = self.primary.lock().expect("primary store mutex poisoned");
                primary.get_by_id(&table_name, &record_id)?.unwrap_or(Value::Null)
            };

            let resolution = match self.config.conflict_resolution {
                ConflictResolutionPolicy::RemoteWins => {
                    self.apply_remote_change(change)?;
                    ConflictResolution::RemoteWins
                }
                ConflictResolutionPolicy::LocalWins => ConflictResolution::LocalWins,
                ConflictResolutionPolicy::Merge => {
                    let merged = merge_conflict(&local_data, &remote_data);
                    self.apply_merged(&table_name, &record_id, &merged)?;
                    ConflictResolution::Merged
                }
            };

            self.metadata.record_conflict(&ConflictRecord {
                sync_id: sync_id.to_string(),
                table_name,
                record_id,
                local_data,
                remote_data,
                resolution,
                resolved_at: Utc::now(),
                resolved_by: format!("policy:{}", policy_name(self.config.conflict_resolution)),
            })?;
        }
        Ok(())
    }

    fn apply_merged(&self, table_name: &str, record_id: &str, merged: &Value) -> Result<()> {
        let mut primary = self.primary.lock().expect("primary store mutex poisoned");
        primary.with_tx(|tx| apply_update_or_insert(tx, table_name, record_id, merged))
    }

    /// One-shot bootstrap used on first activation (spec §4.6).
    pub fn initial_sync(&self) -> Result<InitialSyncReport> {
        let bearer = self.bearer();
        let response = self.transport.initial_sync(&self.device_id, &bearer)?;
        let tables = response
            .as_object()
            .ok_or_else(|| SyncError::SchemaMismatch("initial sync response is not an object".to_string()))?;

        let mut report = InitialSyncReport {
            tables: Vec::new(),
            success: true,
        };

        for table_name in INITIAL_SYNC_TABLE_ORDER {
            let Some(rows) = tables.get(*table_name).and_then(|v| v.as_array()) else {
                continue;
            };

            let mut table_report = TableImportReport {
                table_name: table_name.to_string(),
                inserted: 0,
                updated: 0,
                skipped: 0,
            };

            let mut primary = self.primary.lock().expect("primary store mutex poisoned");
            let import_result = primary.with_tx(|tx| {
                for row in rows {
                    let has_id = row.get("id").and_then(|v| v.as_str());
                    match has_id {
                        Some(id) => match apply_update_or_insert(tx, table_name, id, row) {
                            Ok(()) => table_report.updated += 1,
                            Err(_) => table_report.skipped += 1,
                        },
                        None => match apply_insert(tx, table_name, row) {
                            Ok(()) => table_report.inserted += 1,
                            Err(_) => table_report.skipped += 1,
                        },
                    }
                }
                Ok::<(), SyncError>(())
            });

            if import_result.is_err() {
                report.success = false;
            }
            report.tables.push(table_report);
        }

        Ok(report)
    }

    pub fn heartbeat(&self, api_key: &str) -> bool {
        self.transport.heartbeat(&self.device_id, api_key)
    }
}

fn policy_name(policy: ConflictResolutionPolicy) -> &'static str {
    match policy {
        ConflictResolutionPolicy::RemoteWins => "remote_wins",
        ConflictResolutionPolicy::LocalWins => "local_wins",
        ConflictResolutionPolicy::Merge => "merge",
    }
}

fn apply_insert(tx: &rusqlite::Transaction<'_>, table: &str, row: &Value) -> Result<()> {
    PrimaryStore::insert_tx(tx, table, row)
}

fn apply_update_or_insert(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    record_id: &str,
    row: &Value,
) -> Result<()> {
    if !PrimaryStore::update_by_id_tx(tx, table, record_id, row)? {
        PrimaryStore::insert_tx(tx, table, row)?;
    }
    Ok(())
}

fn apply_delete(tx: &rusqlite::Transaction<'_>, table: &str, record_id: &str) -> Result<()> {
    PrimaryStore::delete_by_id_tx(tx, table, record_id)
}

/// Field-wise merge: union of fields, preferring the side with the later
/// timestamp on overlap when the row carries a recognisable timestamp
/// field, else remote wins the overlapping key (spec §4.6, best-effort).
pub fn merge_conflict(local: &Value, remote: &Value) -> Value {
    let (Some(local_obj), Some(remote_obj)) = (local.as_object(), remote.as_object()) else {
        return remote.clone();
    };

    let mut merged = local_obj.clone();
    let remote_is_newer = row_timestamp(remote) >= row_timestamp(local);

    for (key, remote_value) in remote_obj {
        match merged.get(key) {
            Some(local_value) if local_value != remote_value => {
                if remote_is_newer {
                    merged.insert(key.clone(), remote_value.clone());
                }
            }
            _ => {
                merged.insert(key.clone(), remote_value.clone());
            }
        }
    }
    Value::Object(merged)
}

fn row_timestamp(row: &Value) -> Option<chrono::DateTime<Utc>> {
    for key in ["updated_at", "changed_at", "timestamp"] {
        if let Some(raw) = row.get(key).and_then(|v| v.as_str()) {
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
    }
    None
}
