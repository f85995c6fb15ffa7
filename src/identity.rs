//! Device identity: a stable, deterministic 16-hex-char device id derived
//! from hardware-anchored material, plus best-effort host metadata.

use crate::canonical::sha256_hex;
use serde::{Deserialize, Serialize};
use std::fs;

/// Best-effort host/OS metadata. Missing fields are reported as `None`,
/// never as errors — `system_info()` never fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os_label: String,
    pub hardware_serial: Option<String>,
    pub memory_mib: Option<u64>,
}

/// The identity of this appliance, derived once per boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub hostname: String,
    pub os_label: String,
    pub hardware_serial: Option<String>,
    pub memory_mib: Option<u64>,
}

fn read_hostname() -> String {
    hostname_fallback_source()
}

#[cfg(unix)]
fn hostname_fallback_source() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(not(unix))]
fn hostname_fallback_source() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Read the CPU/board serial from `/proc/cpuinfo` (Raspberry Pi convention).
/// Returns `None` when the file is unreadable or carries no `Serial` line.
fn read_hardware_serial() -> Option<String> {
    let content = fs::read_to_string("/proc/cpuinfo").ok()?;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Serial") {
                let serial = value.trim();
                if !serial.is_empty() && serial.chars().any(|c| c != '0') {
                    return Some(serial.to_string());
                }
            }
        }
    }
    None
}

/// Read total memory in MiB from `/proc/meminfo`. `None` when unreadable.
fn read_memory_mib() -> Option<u64> {
    let content = fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kib: u64 = rest.trim().split_whitespace().next()?.parse().ok()?;
            return Some(kib / 1024);
        }
    }
    None
}

fn read_os_label() -> String {
    fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|content| {
            content.lines().find_map(|line| {
                line.strip_prefix("PRETTY_NAME=")
                    .map(|v| v.trim_matches('"').to_string())
            })
        })
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}

/// Best-effort gathering of hostname, OS label, hardware serial, memory.
/// Never fails; missing fields surface as `None`.
pub fn system_info() -> SystemInfo {
    SystemInfo {
        hostname: read_hostname(),
        os_label: read_os_label(),
        hardware_serial: read_hardware_serial(),
        memory_mib: read_memory_mib(),
    }
}

/// A weak, deterministic stand-in for a real NIC MAC address, derived from
/// the hostname. Documented as not collision-resistant (spec §9): it makes
/// `device_id` unique per *host*, not per physical appliance, when no
/// hardware serial is readable.
fn synthesize_mac_like(hostname: &str) -> String {
    let digest = sha256_hex(hostname.as_bytes());
    let bytes = &digest.as_bytes()[..12];
    let mut out = String::with_capacity(17);
    for (i, chunk) in bytes.chunks(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push(chunk[0] as char);
        out.push(chunk[1] as char);
    }
    out
}

/// Produce the 16-hex-char device identifier described in spec §4.1.
///
/// Deterministic given the host: same physical appliance yields the same
/// id across reboots, computed as the first 16 hex chars of SHA-256 over
/// `(serial-or-hostname-hash) ‖ synthesized-mac ‖ hostname`. Never fails;
/// falls back to hostname-derived material when hardware sources are
/// unreadable.
pub fn device_id() -> String {
    let hostname = read_hostname();
    let anchor = read_hardware_serial().unwrap_or_else(|| sha256_hex(hostname.as_bytes()));
    let mac_like = synthesize_mac_like(&hostname);
    let combined = format!("{anchor}\u{0}{mac_like}\u{0}{hostname}");
    let digest = sha256_hex(combined.as_bytes());
    digest[..16].to_string()
}

impl DeviceIdentity {
    /// Derive the current device's identity.
    pub fn current() -> Self {
        let info = system_info();
        Self {
            device_id: device_id(),
            hostname: info.hostname,
            os_label: info.os_label,
            hardware_serial: info.hardware_serial,
            memory_mib: info.memory_mib,
        }
    }
}
