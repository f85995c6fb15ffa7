//! End-to-end scenario tests (spec.md §8, concrete scenarios 1-6) against
//! a real tempdir-backed metadata/primary store and a fake transport that
//! never opens a socket.

use serde_json::{json, Value};
use stabsstelle_sync::config::EngineConfig;
use stabsstelle_sync::metadata_store::{MetadataStore, Operation};
use stabsstelle_sync::primary_store::PrimaryStore;
use stabsstelle_sync::reconciler::{Reconciler, SyncMode};
use stabsstelle_sync::{LicenseStore, SyncError, SyncTransport};
use std::path::Path;
use std::sync::Mutex;

struct FakeTransport {
    fail: bool,
    initial: Value,
    pull_changes: Value,
    captured_push: Mutex<Option<Value>>,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            fail: false,
            initial: json!({}),
            pull_changes: json!({"changes": []}),
            captured_push: Mutex::new(None),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

impl SyncTransport for FakeTransport {
    fn validate_license(&self, _body: &Value) -> stabsstelle_sync::error::Result<Value> {
        Ok(json!({}))
    }

    fn register_device(&self, _body: &Value) -> stabsstelle_sync::error::Result<Value> {
        Ok(json!({}))
    }

    fn register_legacy(&self, _body: &Value) -> stabsstelle_sync::error::Result<Value> {
        Ok(json!({}))
    }

    fn push(
        &self,
        _device_id: &str,
        _sync_id: &str,
        _bearer: &str,
        _compress: bool,
        body: &Value,
    ) -> stabsstelle_sync::error::Result<Value> {
        if self.fail {
            return Err(SyncError::TransportFailure("network unreachable".to_string()));
        }
        *self.captured_push.lock().unwrap() = Some(body.clone());
        Ok(json!({}))
    }

    fn pull(
        &self,
        _device_id: &str,
        _sync_id: &str,
        _bearer: &str,
        _since: Option<&str>,
        _limit: i64,
    ) -> stabsstelle_sync::error::Result<Value> {
        if self.fail {
            return Err(SyncError::TransportFailure("network unreachable".to_string()));
        }
        Ok(self.pull_changes.clone())
    }

    fn initial_sync(&self, _device_id: &str, _bearer: &str) -> stabsstelle_sync::error::Result<Value> {
        Ok(self.initial.clone())
    }

    fn heartbeat(&self, _device_id: &str, _api_key: &str) -> bool {
        !self.fail
    }
}

fn create_schema(primary_path: &Path) {
    let conn = rusqlite::Connection::open(primary_path).unwrap();
    conn.execute_batch(
        "CREATE TABLE users (id TEXT PRIMARY KEY, username TEXT);
         CREATE TABLE contacts (id TEXT PRIMARY KEY, name TEXT);",
    )
    .unwrap();
}

fn seed_license(config_dir: &Path, device_id: &str, valid_until: chrono::DateTime<chrono::Utc>, sync_enabled: bool) {
    std::fs::create_dir_all(config_dir).unwrap();
    let record = json!({
        "license_key": "TEST-KEY",
        "device_id": device_id,
        "validated_at": chrono::Utc::now().to_rfc3339(),
        "valid_until": valid_until.to_rfc3339(),
        "tier": "pro",
        "organization": null,
        "max_devices": 5,
        "sync_interval_seconds": 900,
        "features": {"sync": sync_enabled},
        "server_url": "https://example.test",
    });
    std::fs::write(
        config_dir.join("license.json"),
        serde_json::to_string_pretty(&record).unwrap(),
    )
    .unwrap();
}

fn build_reconciler(
    dir: &Path,
    device_id: &str,
    transport: FakeTransport,
    config: EngineConfig,
) -> Reconciler {
    let metadata = MetadataStore::open(&dir.join("meta.db")).unwrap();
    let primary_path = dir.join("primary.db");
    create_schema(&primary_path);
    let primary = PrimaryStore::open(&primary_path).unwrap();
    let license = LicenseStore::new(dir.to_path_buf(), "https://example.test");
    Reconciler::with_transport(
        device_id.to_string(),
        metadata,
        primary,
        Box::new(transport),
        license,
        config,
    )
}

#[test]
fn scenario_1_bootstrap_imports_initial_rows() {
    let dir = tempfile::tempdir().unwrap();
    let device_id = stabsstelle_sync::identity::device_id();
    seed_license(dir.path(), &device_id, chrono::Utc::now() + chrono::Duration::days(30), true);

    let mut transport = FakeTransport::new();
    transport.initial = json!({"users": [{"id": "1", "username": "admin"}]});

    let reconciler = build_reconciler(dir.path(), &device_id, transport, EngineConfig::default());
    let report = reconciler.initial_sync().unwrap();
    assert!(report.success);

    let primary = PrimaryStore::open(&dir.path().join("primary.db")).unwrap();
    let row = primary.get_by_id("users", "1").unwrap().unwrap();
    assert_eq!(row["username"], "admin");

    let metadata = MetadataStore::open(&dir.path().join("meta.db")).unwrap();
    assert!(metadata.pending(10).unwrap().is_empty());
}

#[test]
fn scenario_2_local_only_push_marks_entries_synced() {
    let dir = tempfile::tempdir().unwrap();
    let device_id = stabsstelle_sync::identity::device_id();
    seed_license(dir.path(), &device_id, chrono::Utc::now() + chrono::Duration::days(30), true);

    {
        let metadata = MetadataStore::open(&dir.path().join("meta.db")).unwrap();
        metadata
            .track_change("contacts", "c1", Operation::Insert, Some(&json!({"id": "c1", "name": "A"})))
            .unwrap();
    }

    let transport = FakeTransport::new();
    let reconciler = build_reconciler(dir.path(), &device_id, transport, EngineConfig::default());
    reconciler.sync(SyncMode::Push).unwrap();

    let metadata = MetadataStore::open(&dir.path().join("meta.db")).unwrap();
    assert!(metadata.pending(10).unwrap().is_empty());
    assert!(!metadata.has_unsynced_change("contacts", "c1").unwrap());
}

#[test]
fn scenario_3_remote_only_pull_applies_rows_without_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let device_id = stabsstelle_sync::identity::device_id();
    seed_license(dir.path(), &device_id, chrono::Utc::now() + chrono::Duration::days(30), true);

    let mut transport = FakeTransport::new();
    transport.pull_changes = json!({
        "changes": [
            {"table_name": "contacts", "record_id": "c2", "operation": "INSERT", "data": {"id": "c2", "name": "B"}}
        ]
    });

    let reconciler = build_reconciler(dir.path(), &device_id, transport, EngineConfig::default());
    reconciler.sync(SyncMode::Pull).unwrap();

    let primary = PrimaryStore::open(&dir.path().join("primary.db")).unwrap();
    let row = primary.get_by_id("contacts", "c2").unwrap().unwrap();
    assert_eq!(row["name"], "B");
}

#[test]
fn scenario_4_conflict_resolves_remote_wins_and_retains_local_entry() {
    let dir = tempfile::tempdir().unwrap();
    let device_id = stabsstelle_sync::identity::device_id();
    seed_license(dir.path(), &device_id, chrono::Utc::now() + chrono::Duration::days(30), true);

    let metadata_path = dir.path().join("meta.db");
    {
        let metadata = MetadataStore::open(&metadata_path).unwrap();
        metadata
            .track_change("contacts", "c1", Operation::Update, Some(&json!({"name": "AA"})))
            .unwrap();
    }

    let mut transport = FakeTransport::new();
    transport.pull_changes = json!({
        "changes": [
            {"table_name": "contacts", "record_id": "c1", "operation": "UPDATE", "data": {"name": "ZZ"}}
        ]
    });

    let reconciler = build_reconciler(dir.path(), &device_id, transport, EngineConfig::default());
    // seed an existing contacts row so the conflicting UPDATE has something to touch
    {
        let primary = PrimaryStore::open(&dir.path().join("primary.db")).unwrap();
        primary.insert("contacts", &json!({"id": "c1", "name": "A"})).unwrap();
    }

    reconciler.sync(SyncMode::Pull).unwrap();

    let primary = PrimaryStore::open(&dir.path().join("primary.db")).unwrap();
    let row = primary.get_by_id("contacts", "c1").unwrap().unwrap();
    assert_eq!(row["name"], "ZZ");

    let metadata = MetadataStore::open(&metadata_path).unwrap();
    assert_eq!(metadata.conflict_count().unwrap(), 1);
    assert!(metadata.has_unsynced_change("contacts", "c1").unwrap());
}

#[test]
fn scenario_5_offline_degradation_leaves_change_unsynced() {
    let dir = tempfile::tempdir().unwrap();
    let device_id = stabsstelle_sync::identity::device_id();
    seed_license(dir.path(), &device_id, chrono::Utc::now() + chrono::Duration::days(30), true);

    let metadata_path = dir.path().join("meta.db");
    {
        let metadata = MetadataStore::open(&metadata_path).unwrap();
        metadata
            .track_change("contacts", "c1", Operation::Insert, Some(&json!({"id": "c1", "name": "A"})))
            .unwrap();
    }

    let reconciler = build_reconciler(dir.path(), &device_id, FakeTransport::failing(), EngineConfig::default());
    let err = reconciler.sync(SyncMode::Push).unwrap_err();
    assert!(matches!(err, SyncError::TransportFailure(_)));

    let metadata = MetadataStore::open(&metadata_path).unwrap();
    assert_eq!(metadata.pending(10).unwrap().len(), 1);
    assert!(!metadata.any_session_running().unwrap());
}

#[test]
fn scenario_6_expired_license_blocks_sync() {
    let dir = tempfile::tempdir().unwrap();
    let device_id = stabsstelle_sync::identity::device_id();
    seed_license(dir.path(), &device_id, chrono::Utc::now() - chrono::Duration::days(1), true);

    let reconciler = build_reconciler(dir.path(), &device_id, FakeTransport::new(), EngineConfig::default());
    let err = reconciler.sync(SyncMode::Bidirectional).unwrap_err();
    assert!(matches!(err, SyncError::LicenseInvalid));
}

