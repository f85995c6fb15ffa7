//! License store: persists the activation record, validates it offline,
//! refreshes it online, and exposes the feature map and sync policy
//! (spec §4.2).

use crate::error::{Result, SyncError};
use crate::identity::{system_info, DeviceIdentity};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const RECOGNIZED_FEATURES: &[&str] = &[
    "core", "offline", "maps", "sync", "wiki", "resources", "scenarios", "api_access",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub license_key: String,
    pub device_id: String,
    pub validated_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub tier: String,
    pub organization: Option<String>,
    pub max_devices: u32,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,
    pub features: HashMap<String, bool>,
    pub server_url: String,
}

fn default_sync_interval() -> u64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub device_id: String,
    pub registered_at: DateTime<Utc>,
    pub token: Option<String>,
    pub sync_endpoint: Option<String>,
    pub features: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyRegistration {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfigView {
    pub enabled: bool,
    pub interval: u64,
    pub server_url: String,
    pub device_id: Option<String>,
    pub license_key: Option<String>,
}

pub struct LicenseStore {
    config_dir: PathBuf,
    transport: Transport,
    server_url_hint: String,
}

impl LicenseStore {
    pub fn new(config_dir: PathBuf, server_url: impl Into<String>) -> Self {
        let server_url_hint = server_url.into();
        Self {
            config_dir,
            transport: Transport::new(server_url_hint.clone()),
            server_url_hint,
        }
    }

    fn license_path(&self) -> PathBuf {
        self.config_dir.join("license.json")
    }

    fn device_path(&self) -> PathBuf {
        self.config_dir.join("device.json")
    }

    fn write_atomically(&self, path: &Path, json: &str) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.config_dir)?;
        std::fs::write(tmp.path(), json)?;
        set_owner_only_permissions(tmp.path())?;
        tmp.persist(path)
            .map_err(|e| SyncError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    fn load_license(&self) -> Option<LicenseRecord> {
        let raw = std::fs::read_to_string(self.license_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn save_license(&self, record: &LicenseRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        self.write_atomically(&self.license_path(), &json)
    }

    fn save_device(&self, value: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        self.write_atomically(&self.device_path(), &json)
    }

    /// Online validation: POSTs to `/api/pi/licenses/validate`. Falls
    /// back to `validate_offline` on a connection failure (spec §4.2).
    pub fn validate_online(&self, license_key: &str) -> Result<LicenseRecord> {
        let identity = DeviceIdentity::current();
        let info = system_info();
        let body = serde_json::json!({
            "license_key": license_key,
            "device_id": identity.device_id,
            "hostname": identity.hostname,
            "pi_version": env!("CARGO_PKG_VERSION"),
            "system_info": info,
            "registration_type": "validation",
        });

        let response = match self.transport.validate_license(&body) {
            Ok(response) => response,
            Err(SyncError::TransportFailure(_)) => return self.validate_offline(license_key),
            Err(other) => return Err(other),
        };

        let valid_until: DateTime<Utc> = response
            .get("valid_until")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .ok_or_else(|| SyncError::ServerRejection {
                status: 200,
                message: "missing valid_until in response".to_string(),
            })?;

        let features: HashMap<String, bool> = response
            .get("features")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let record = LicenseRecord {
            license_key: license_key.to_string(),
            device_id: identity.device_id.clone(),
            validated_at: Utc::now(),
            valid_until,
            tier: response
                .get("tier")
                .and_then(|v| v.as_str())
                .unwrap_or("basic")
                .to_string(),
            organization: response
                .get("organization")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            max_devices: response
                .get("max_devices")
                .and_then(|v| v.as_u64())
                .unwrap_or(1) as u32,
            sync_interval_seconds: response
                .get("sync_interval")
                .and_then(|v| v.as_u64())
                .unwrap_or(900),
            features,
            server_url: self.transport_server_url(),
        };

        self.save_license(&record)?;
        self.save_device(&serde_json::to_value(&identity)?)?;
        Ok(record)
    }

    fn transport_server_url(&self) -> String {
        // Re-derive from the already-configured transport is not exposed;
        // callers construct `LicenseStore` with the server URL they want
        // persisted, so echo that value back out of the license record.
        self.server_url_hint.clone()
    }

    /// Offline validation against the persisted record.
    pub fn validate_offline(&self, license_key: &str) -> Result<LicenseRecord> {
        let record = self
            .load_license()
            .ok_or(SyncError::LicenseInvalid)?;
        if record.license_key != license_key {
            return Err(SyncError::KeyMismatch);
        }
        if record.device_id != DeviceIdentity::current().device_id {
            return Err(SyncError::DeviceMismatch);
        }
        if Utc::now() > record.valid_until {
            return Err(SyncError::Expired);
        }
        Ok(record)
    }

    /// Register this device with the modern endpoint.
    pub fn register_device(&self, license_key: &str) -> Result<RegistrationInfo> {
        let identity = DeviceIdentity::current();
        let info = system_info();
        let body = serde_json::json!({
            "license_key": license_key,
            "device_id": identity.device_id,
            "hostname": identity.hostname,
            "system_info": info,
            "registration_type": "initial",
        });
        let response = self.transport.register_device(&body)?;
        let registration = RegistrationInfo {
            device_id: identity.device_id.clone(),
            registered_at: Utc::now(),
            token: response.get("token").and_then(|v| v.as_str()).map(str::to_string),
            sync_endpoint: response
                .get("sync_endpoint")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            features: response
                .get("features")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
        };
        self.save_device(&serde_json::to_value(&registration)?)?;
        Ok(registration)
    }

    /// Register via the legacy `/api/pi/register` endpoint (spec §6),
    /// returning the bare `api_key` used as `X-API-Key` thereafter.
    pub fn register_legacy(
        &self,
        license_key: &str,
        device_name: &str,
        device_type: &str,
        os_version: &str,
        app_version: &str,
    ) -> Result<LegacyRegistration> {
        let identity = DeviceIdentity::current();
        let body = serde_json::json!({
            "device_id": identity.device_id,
            "device_name": device_name,
            "device_type": device_type,
            "os_version": os_version,
            "app_version": app_version,
            "license_key": license_key,
        });
        let response = self.transport.register_legacy(&body)?;
        let api_key = response
            .get("api_key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::ServerRejection {
                status: 200,
                message: "missing api_key in response".to_string(),
            })?
            .to_string();
        Ok(LegacyRegistration { api_key })
    }

    /// True iff a persisted record exists, the device id matches, and
    /// `now <= valid_until`.
    pub fn is_valid(&self) -> bool {
        match self.load_license() {
            Some(record) => {
                record.device_id == DeviceIdentity::current().device_id
                    && Utc::now() <= record.valid_until
            }
            None => false,
        }
    }

    /// Derived sync policy view.
    pub fn sync_config(&self) -> SyncConfigView {
        match self.load_license() {
            Some(record) => SyncConfigView {
                enabled: *record.features.get("sync").unwrap_or(&false),
                interval: record.sync_interval_seconds,
                server_url: record.server_url,
                device_id: Some(record.device_id),
                license_key: Some(record.license_key),
            },
            None => SyncConfigView {
                enabled: false,
                interval: 3600,
                server_url: self.server_url_hint.clone(),
                device_id: None,
                license_key: None,
            },
        }
    }

    /// The feature map; defaults to `core`/`offline` enabled when no
    /// record exists.
    pub fn features(&self) -> HashMap<String, bool> {
        match self.load_license() {
            Some(record) => record.features,
            None => {
                let mut defaults = HashMap::new();
                for feature in RECOGNIZED_FEATURES {
                    defaults.insert(feature.to_string(), matches!(*feature, "core" | "offline"));
                }
                defaults
            }
        }
    }

    pub fn current_record(&self) -> Option<LicenseRecord> {
        self.load_license()
    }
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_dir() -> (LicenseStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LicenseStore::new(dir.path().to_path_buf(), "https://example.test");
        (store, dir)
    }

    #[test]
    fn no_record_means_invalid_and_default_features() {
        let (store, _dir) = store_with_dir();
        assert!(!store.is_valid());
        let features = store.features();
        assert_eq!(features.get("core"), Some(&true));
        assert_eq!(features.get("offline"), Some(&true));
        assert_eq!(features.get("sync"), Some(&false));
    }

    #[test]
    fn no_record_sync_config_disabled() {
        let (store, _dir) = store_with_dir();
        let config = store.sync_config();
        assert!(!config.enabled);
        assert_eq!(config.interval, 3600);
    }

    #[test]
    fn offline_validation_rejects_key_mismatch() {
        let (store, _dir) = store_with_dir();
        let record = LicenseRecord {
            license_key: "ORIGINAL".to_string(),
            device_id: DeviceIdentity::current().device_id,
            validated_at: Utc::now(),
            valid_until: Utc::now() + chrono::Duration::days(30),
            tier: "pro".to_string(),
            organization: None,
            max_devices: 5,
            sync_interval_seconds: 900,
            features: HashMap::from([("sync".to_string(), true)]),
            server_url: "https://example.test".to_string(),
        };
        store.save_license(&record).unwrap();

        let err = store.validate_offline("DIFFERENT").unwrap_err();
        assert!(matches!(err, SyncError::KeyMismatch));
    }

    #[test]
    fn offline_validation_rejects_expired() {
        let (store, _dir) = store_with_dir();
        let record = LicenseRecord {
            license_key: "KEY".to_string(),
            device_id: DeviceIdentity::current().device_id,
            validated_at: Utc::now() - chrono::Duration::days(60),
            valid_until: Utc::now() - chrono::Duration::days(1),
            tier: "pro".to_string(),
            organization: None,
            max_devices: 5,
            sync_interval_seconds: 900,
            features: HashMap::new(),
            server_url: "https://example.test".to_string(),
        };
        store.save_license(&record).unwrap();

        let err = store.validate_offline("KEY").unwrap_err();
        assert!(matches!(err, SyncError::Expired));
        assert!(!store.is_valid());
    }

    #[test]
    fn valid_record_round_trips_through_is_valid() {
        let (store, _dir) = store_with_dir();
        let record = LicenseRecord {
            license_key: "KEY".to_string(),
            device_id: DeviceIdentity::current().device_id,
            validated_at: Utc::now(),
            valid_until: Utc::now() + chrono::Duration::days(30),
            tier: "pro".to_string(),
            organization: Some("Leitstelle".to_string()),
            max_devices: 5,
            sync_interval_seconds: 600,
            features: HashMap::from([("sync".to_string(), true)]),
            server_url: "https://example.test".to_string(),
        };
        store.save_license(&record).unwrap();
        assert!(store.is_valid());
        assert!(store.sync_config().enabled);
    }
}
