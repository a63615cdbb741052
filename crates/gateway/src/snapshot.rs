// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Whole-device read results and the missing-value sentinel.

use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Sentinel for a failed read. Appears in snapshots and wire payloads, where
/// it is serialized as the integer -1.
pub const MISSING: f64 = -1.0;

pub fn is_missing(value: f64) -> bool {
    value == MISSING
}

/// Current epoch time in seconds.
pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A time-stamped whole-device read result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub device_id: String,
    pub model: String,
    pub slave_id: u8,
    pub device_type: String,
    pub sampling_ts: DateTime<Local>,
    pub values: IndexMap<String, f64>,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_virtual: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_device_ids: Vec<String>,
}

impl Snapshot {
    pub fn new(model: &str, slave_id: u8, device_type: &str) -> Self {
        Self {
            device_id: device_id(model, slave_id),
            model: model.to_owned(),
            slave_id,
            device_type: device_type.to_owned(),
            sampling_ts: Local::now(),
            values: IndexMap::new(),
            is_online: false,
            is_virtual: false,
            source_device_ids: Vec::new(),
        }
    }

    /// Any non-missing numeric value means the device answered something.
    pub fn any_value_present(&self) -> bool {
        self.values.values().any(|v| !is_missing(*v))
    }
}

/// Canonical device identifier: `<model>_<slave_id>`.
pub fn device_id(model: &str, slave_id: u8) -> String {
    format!("{model}_{slave_id}")
}

/// Split a device id back into model and slave id. Models may themselves
/// contain underscores, so the split is on the last one.
pub fn split_device_id(device_id: &str) -> Option<(&str, u8)> {
    let (model, slave) = device_id.rsplit_once('_')?;
    let slave_id = slave.parse().ok()?;
    Some((model, slave_id))
}
