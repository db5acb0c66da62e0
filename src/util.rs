//! Parsing and formatting helpers for resource limits, stats, and ports

use std::collections::BTreeMap;

use rand::{rngs::OsRng, RngCore};
use serde_json::{json, Map, Value};

use crate::{
    engine::{HostConfigRep, StatsSample},
    errors::{Error, Result},
};

const KIB: u64 = 1024;

/// Generate a short random container name like `pd-a1b2c3d4`
pub(crate) fn generate_name() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    format!("pd-{}", hex::encode(bytes))
}

/// Generate a 16-hex-char token for the session sentinel protocol
pub(crate) fn generate_token() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Parse a memory limit string like `256m` or `1g` into bytes.
///
/// Suffixes `b`, `k`, `m`, `g`, `t` are accepted case-insensitively;
/// a plain integer is bytes. Invalid input is an error, never a silent
/// zero.
pub fn parse_mem_limit(s: &str) -> Result<u64> {
    let trimmed = s.trim().to_ascii_lowercase();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| trimmed.len());
    if digits_end == 0 {
        return Err(Error::InvalidParameter(format!(
            "invalid memory limit: {:?}",
            s
        )));
    }
    let value: u64 = trimmed[..digits_end]
        .parse()
        .map_err(|_| Error::InvalidParameter(format!("invalid memory limit: {:?}", s)))?;
    let multiplier = match trimmed[digits_end..].trim() {
        "" | "b" => 1,
        "k" => KIB,
        "m" => KIB * KIB,
        "g" => KIB * KIB * KIB,
        "t" => KIB * KIB * KIB * KIB,
        _ => {
            return Err(Error::InvalidParameter(format!(
                "invalid memory limit: {:?}",
                s
            )))
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidParameter(format!("invalid memory limit: {:?}", s)))
}

/// Format a byte count as a human-readable string (e.g. `42.1 MB`)
pub fn format_bytes(n: u64) -> String {
    let mut value = n as f64;
    for unit in &["B", "KB", "MB", "GB"] {
        if value < KIB as f64 {
            if *unit == "B" {
                return format!("{} B", value as u64);
            }
            return format!("{:.1} {}", value, unit);
        }
        value /= KIB as f64;
    }
    format!("{:.1} TB", value)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Compute CPU usage percentage from a stats sample's usage deltas
pub(crate) fn compute_cpu_percent(stats: &StatsSample) -> f64 {
    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta =
        stats.cpu_stats.system_cpu_usage as f64 - stats.precpu_stats.system_cpu_usage as f64;
    let online = stats.cpu_stats.online_cpus as f64;
    if system_delta > 0.0 && online > 0.0 {
        round2(cpu_delta / system_delta * online * 100.0)
    } else {
        0.0
    }
}

/// Build the `HostConfig.PortBindings` object from a host-to-container
/// port map
pub(crate) fn build_port_bindings(ports: &BTreeMap<u32, u32>) -> Value {
    let mut bindings = Map::new();
    for (host, container) in ports {
        bindings.insert(
            format!("{}/tcp", container),
            json!([{ "HostPort": host.to_string() }]),
        );
    }
    Value::Object(bindings)
}

/// Build the `ExposedPorts` object mirroring the port bindings
pub(crate) fn build_exposed_ports(ports: &BTreeMap<u32, u32>) -> Value {
    let mut exposed = Map::new();
    for container in ports.values() {
        exposed.insert(format!("{}/tcp", container), json!({}));
    }
    Value::Object(exposed)
}

/// Recover the host-to-container port map from an inspected host config
pub(crate) fn parse_port_bindings(host_config: &HostConfigRep) -> BTreeMap<u32, u32> {
    let mut ports = BTreeMap::new();
    if let Some(ref bindings) = host_config.port_bindings {
        for (key, binds) in bindings {
            let container: u32 = match key.split('/').next().and_then(|p| p.parse().ok()) {
                Some(port) => port,
                None => continue,
            };
            let host: u32 = match binds
                .first()
                .and_then(|b| b.get("HostPort"))
                .and_then(|p| p.parse().ok())
            {
                Some(port) => port,
                None => continue,
            };
            ports.insert(host, container);
        }
    }
    ports
}
