// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cloud upload envelope and item conversion.
//!
//! Wire shape:
//! `{"FUNC": "PushIMAData", "version": "6.0", "GatewayID": ..., "Timestamp":
//! "YYYYMMDDHHMMSS", "Data": [...]}`. The missing sentinel serializes as the
//! integer -1 everywhere in item data.

use chrono::{DateTime, Local};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::snapshot::{is_missing, Snapshot};

pub const PAYLOAD_FUNC: &str = "PushIMAData";
pub const PAYLOAD_VERSION: &str = "6.0";

/// Hostname wins when it looks like a provisioned 11-character gateway id;
/// the placeholder hostname falls back to configuration.
pub fn resolve_gateway_id(config_gateway_id: &str) -> String {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    resolve_gateway_id_from(config_gateway_id, &hostname)
}

pub fn resolve_gateway_id_from(config_gateway_id: &str, hostname: &str) -> String {
    if hostname.len() == 11 && hostname != "99999999999" {
        info!(gateway_id = hostname, "using hostname gateway id");
        return hostname.to_owned();
    }
    let gateway_id: String = config_gateway_id.chars().take(11).collect();
    info!(gateway_id = %gateway_id, "using configured gateway id");
    gateway_id
}

/// Equipment type code embedded in cloud device ids.
pub fn equipment_code(device_type: &str) -> &'static str {
    match device_type.to_lowercase().as_str() {
        "power_meter" => "PM",
        "inverter" | "vfd" | "inverter_vfd" => "IV",
        "thermometer" | "sensor" => "SE",
        "io_module" => "IO",
        _ => "XX",
    }
}

/// Cloud device id: `<gateway>_<series><slave:02><equipment code>`.
pub fn cloud_device_id(gateway_id: &str, series: u32, snapshot: &Snapshot) -> String {
    format!(
        "{gateway_id}_{series}{:02}{}",
        snapshot.slave_id,
        equipment_code(&snapshot.device_type)
    )
}

fn number(value: f64) -> Value {
    if is_missing(value) {
        return json!(-1);
    }
    serde_json::Number::from_f64(value).map(Value::Number).unwrap_or(json!(-1))
}

/// Convert one snapshot into a cloud item.
pub fn snapshot_to_item(gateway_id: &str, series: u32, snapshot: &Snapshot) -> Value {
    let mut data = Map::new();
    for (name, value) in &snapshot.values {
        data.insert(name.clone(), number(*value));
    }
    data.insert("is_online".to_owned(), json!(if snapshot.is_online { 1 } else { 0 }));
    json!({
        "DeviceID": cloud_device_id(gateway_id, series, snapshot),
        "Data": Value::Object(data),
    })
}

/// Wrap items into one POST payload stamped with the label time.
pub fn wrap_items_as_payload(
    gateway_id: &str,
    items: Vec<Value>,
    label_time: DateTime<Local>,
) -> Value {
    json!({
        "FUNC": PAYLOAD_FUNC,
        "version": PAYLOAD_VERSION,
        "GatewayID": gateway_id,
        "Timestamp": label_time.format("%Y%m%d%H%M%S").to_string(),
        "Data": items,
    })
}

/// Gateway heartbeat item appended to every payload.
pub fn heartbeat_item(
    gateway_id: &str,
    series: u32,
    report_time: DateTime<Local>,
    ssh_port: u16,
    cpu_temp: f64,
    reboot_count: u64,
) -> Value {
    json!({
        "DeviceID": format!("{gateway_id}_{series}00GW"),
        "Data": {
            "HB": 1,
            "report_ts": report_time.to_rfc3339(),
            "SSHPort": ssh_port,
            "WebBulbOffset": cpu_temp,
            "Status": reboot_count,
        },
    })
}

#[cfg(test)]
#[path = "payload_tests.rs"]
mod tests;
