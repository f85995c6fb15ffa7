//! Transport: a thin HTTP client with a fixed endpoint surface on the
//! authority (spec §4.5, §6). Synchronous/blocking by design — the engine
//! has no async runtime; "separate worker units" from spec §5 are OS
//! threads, not futures.

use crate::error::{Result, SyncError};
use flate2::{write::GzEncoder, Compression};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::Write;
use std::time::Duration;

const PUSH_PULL_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(60);
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// A successful (possibly gzip-encoded) JSON response, already decoded.
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

/// The wire surface the reconciler needs from the central authority.
/// Exists so tests can supply a fake implementation instead of opening
/// real sockets.
pub trait SyncTransport: Send + Sync {
    fn validate_license(&self, body: &Value) -> Result<Value>;
    fn register_device(&self, body: &Value) -> Result<Value>;
    fn register_legacy(&self, body: &Value) -> Result<Value>;
    fn push(&self, device_id: &str, sync_id: &str, bearer: &str, compress: bool, body: &Value) -> Result<Value>;
    fn pull(
        &self,
        device_id: &str,
        sync_id: &str,
        bearer: &str,
        since: Option<&str>,
        limit: i64,
    ) -> Result<Value>;
    fn initial_sync(&self, device_id: &str, bearer: &str) -> Result<Value>;
    fn heartbeat(&self, device_id: &str, api_key: &str) -> bool;
}

pub struct Transport {
    client: reqwest::blocking::Client,
    server_url: String,
}

impl Transport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            server_url: server_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }

    /// `SHA-256(<license_key>:<device_id>:<unix_seconds>)` as lowercase
    /// hex (spec §4.5). Computed fresh per call — the embedded timestamp
    /// makes a token effectively single-use.
    pub fn bearer_token(license_key: &str, device_id: &str) -> String {
        let now = chrono::Utc::now().timestamp();
        let material = format!("{license_key}:{device_id}:{now}");
        crate::canonical::sha256_hex(material.as_bytes())
    }

    fn gzip(body: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body)?;
        Ok(encoder.finish()?)
    }

    fn handle_response(response: reqwest::blocking::Response) -> Result<TransportResponse> {
        let status = response.status().as_u16();
        let is_gzip = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .map(|v| v == "gzip")
            .unwrap_or(false);
        // reqwest's `gzip` feature transparently decodes bodies marked
        // Content-Encoding: gzip before we ever see the bytes, so by the
        // time we're here `bytes()` is already plain JSON either way.
        let _ = is_gzip;
        let bytes = response.bytes().map_err(SyncError::Http)?;

        if !(200..300).contains(&status) {
            let message = serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(SyncError::ServerRejection { status, message });
        }

        let body = if bytes.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok(TransportResponse { status, body })
    }

    fn post_json(
        &self,
        path: &str,
        body: &Value,
        headers: Vec<(&'static str, String)>,
        compress: bool,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        let mut request = self
            .client
            .post(self.url(path))
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = if compress {
            let raw = serde_json::to_vec(body)?;
            let compressed = Self::gzip(&raw)?;
            request
                .header("Content-Encoding", "gzip")
                .body(compressed)
                .send()
                .map_err(|e| SyncError::TransportFailure(e.to_string()))?
        } else {
            request
                .json(body)
                .send()
                .map_err(|e| SyncError::TransportFailure(e.to_string()))?
        };

        Self::handle_response(response)
    }

    fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        headers: Vec<(&'static str, String)>,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        let mut request = self.client.get(self.url(path)).timeout(timeout);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        let response = request
            .query(query)
            .send()
            .map_err(|e| SyncError::TransportFailure(e.to_string()))?;
        Self::handle_response(response)
    }

    pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
        Ok(serde_json::from_value(value)?)
    }
}

impl SyncTransport for Transport {
    fn validate_license(&self, body: &Value) -> Result<Value> {
        Ok(self
            .post_json("/api/pi/licenses/validate", body, vec![], false, VALIDATION_TIMEOUT)?
            .body)
    }

    fn register_device(&self, body: &Value) -> Result<Value> {
        Ok(self
            .post_json("/api/pi/devices/register", body, vec![], false, VALIDATION_TIMEOUT)?
            .body)
    }

    fn register_legacy(&self, body: &Value) -> Result<Value> {
        Ok(self
            .post_json("/api/pi/register", body, vec![], false, VALIDATION_TIMEOUT)?
            .body)
    }

    fn push(
        &self,
        device_id: &str,
        sync_id: &str,
        bearer: &str,
        compress: bool,
        body: &Value,
    ) -> Result<Value> {
        let headers = vec![
            ("X-Device-ID", device_id.to_string()),
            ("X-Sync-ID", sync_id.to_string()),
            ("Authorization", format!("Bearer {bearer}")),
        ];
        Ok(self
            .post_json("/api/pi/sync/push", body, headers, compress, PUSH_PULL_TIMEOUT)?
            .body)
    }

    fn pull(
        &self,
        device_id: &str,
        sync_id: &str,
        bearer: &str,
        since: Option<&str>,
        limit: i64,
    ) -> Result<Value> {
        let headers = vec![
            ("X-Device-ID", device_id.to_string()),
            ("X-Sync-ID", sync_id.to_string()),
            ("Authorization", format!("Bearer {bearer}")),
        ];
        let mut query = vec![
            ("device_id", device_id.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        Ok(self
            .get("/api/pi/sync/pull", &query, headers, PUSH_PULL_TIMEOUT)?
            .body)
    }

    fn initial_sync(&self, device_id: &str, bearer: &str) -> Result<Value> {
        let headers = vec![("Authorization", format!("Bearer {bearer}"))];
        let query = vec![("device_id", device_id.to_string())];
        Ok(self
            .get("/api/pi/sync/initial", &query, headers, INITIAL_SYNC_TIMEOUT)?
            .body)
    }

    fn heartbeat(&self, device_id: &str, api_key: &str) -> bool {
        let body = serde_json::json!({"device_id": device_id, "api_key": api_key});
        let headers = vec![("X-API-Key", api_key.to_string())];
        self.post_json("/api/pi/heartbeat", &body, headers, false, HEARTBEAT_TIMEOUT)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_is_64_hex_chars() {
        let token = Transport::bearer_token("KEY", "abc123");
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn gzip_round_trips_through_flate2() {
        let raw = b"{\"hello\":\"world\"}";
        let compressed = Transport::gzip(raw).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut out).unwrap();
        assert_eq!(out.as_bytes(), raw);
    }
}
