// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Synthetic devices aggregated from physical snapshots.
//!
//! A virtual device collects matching physical snapshots each tick, applies
//! per-field aggregation, and emits a snapshot indistinguishable from a
//! physical one downstream (storage, alerts, cloud uplink).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::snapshot::{is_missing, split_device_id, Snapshot, MISSING};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Sum,
    Avg,
    Min,
    Max,
    CalculatedPf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Any missing source makes the field missing.
    #[default]
    FailFast,
    /// Aggregate over whatever sources are available.
    Partial,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub method: AggregationMethod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub model: String,
    /// `None` or empty aggregates every instance of the model.
    #[serde(default)]
    pub slave_ids: Option<Vec<u8>>,
}

/// Target slave id: explicit, or `"auto"` = max existing + 1.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetSlaveId {
    Fixed(u8),
    Auto(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    pub model: String,
    pub slave_id: TargetSlaveId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationSpec {
    #[serde(default)]
    pub error_handling: ErrorHandling,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualDeviceSpec {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: SourceSpec,
    pub target: TargetSpec,
    pub aggregation: AggregationSpec,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtualDevicesConfig {
    #[serde(default)]
    pub virtual_devices: Vec<VirtualDeviceSpec>,
}

/// Computes virtual snapshots after each physical polling pass.
pub struct VirtualDeviceManager {
    specs: Vec<VirtualDeviceSpec>,
    /// Fallback for `"auto"` target ids: max physical slave id + 1.
    max_physical_slave_id: u8,
}

impl VirtualDeviceManager {
    pub fn new(config: VirtualDevicesConfig, max_physical_slave_id: u8) -> Self {
        let specs: Vec<VirtualDeviceSpec> =
            config.virtual_devices.into_iter().filter(|spec| spec.enabled).collect();
        for spec in &specs {
            debug!(
                id = %spec.id,
                source_model = %spec.source.model,
                target_model = %spec.target.model,
                "virtual device registered"
            );
        }
        if specs.is_empty() {
            info!("no virtual devices enabled");
        } else {
            info!(count = specs.len(), "virtual device manager initialized");
        }
        Self { specs, max_physical_slave_id }
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Compute one snapshot per enabled spec. A spec with no matching
    /// sources yields nothing; one spec's failure never affects another.
    pub fn compute_virtual_snapshots(
        &self,
        raw: &HashMap<String, Arc<Snapshot>>,
    ) -> Vec<Snapshot> {
        let mut out = Vec::new();
        for spec in &self.specs {
            if spec.kind != "aggregated_power_meter" {
                error!(id = %spec.id, kind = %spec.kind, "unknown virtual device type");
                continue;
            }
            if let Some(snapshot) = self.compute_one(spec, raw) {
                out.push(snapshot);
            }
        }
        out
    }

    fn compute_one(
        &self,
        spec: &VirtualDeviceSpec,
        raw: &HashMap<String, Arc<Snapshot>>,
    ) -> Option<Snapshot> {
        let source_ids = self.find_sources(spec, raw);
        if source_ids.is_empty() {
            warn!(id = %spec.id, model = %spec.source.model, "no source devices found");
            return None;
        }

        let target_slave_id = match &spec.target.slave_id {
            TargetSlaveId::Fixed(id) => *id,
            TargetSlaveId::Auto(_) => self.max_physical_slave_id + 1,
        };

        let mut values = indexmap::IndexMap::new();
        let mut all_failed = true;

        for field in &spec.aggregation.fields {
            if field.method == AggregationMethod::CalculatedPf {
                continue;
            }
            let value = aggregate_field(field, &source_ids, raw, spec.aggregation.error_handling);
            if !is_missing(value) {
                all_failed = false;
            }
            values.insert(field.name.clone(), value);
        }

        // Power factor comes from the aggregated totals, never from
        // averaging the per-meter factors.
        for field in &spec.aggregation.fields {
            if field.method == AggregationMethod::CalculatedPf {
                let pf = calculate_power_factor(&values);
                if !is_missing(pf) {
                    all_failed = false;
                }
                values.insert(field.name.clone(), pf);
            }
        }

        if all_failed {
            warn!(id = %spec.id, "all aggregated fields failed, emitting all-missing snapshot");
        }

        let sampling_ts = source_ids
            .iter()
            .filter_map(|id| raw.get(id))
            .map(|snap| snap.sampling_ts)
            .max()?;

        let mut snapshot = Snapshot::new(&spec.target.model, target_slave_id, "power_meter");
        snapshot.sampling_ts = sampling_ts;
        snapshot.values = values;
        snapshot.is_online = !all_failed;
        snapshot.is_virtual = true;
        snapshot.source_device_ids = source_ids;
        Some(snapshot)
    }

    fn find_sources(
        &self,
        spec: &VirtualDeviceSpec,
        raw: &HashMap<String, Arc<Snapshot>>,
    ) -> Vec<String> {
        let mut ids: Vec<String> = raw
            .values()
            .filter(|snap| !snap.is_virtual)
            .filter(|snap| {
                let Some((model, slave_id)) = split_device_id(&snap.device_id) else {
                    warn!(device = %snap.device_id, "invalid device id format");
                    return false;
                };
                if model != spec.source.model {
                    return false;
                }
                match &spec.source.slave_ids {
                    Some(filter) if !filter.is_empty() => filter.contains(&slave_id),
                    _ => true,
                }
            })
            .map(|snap| snap.device_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn aggregate_field(
    field: &FieldSpec,
    source_ids: &[String],
    raw: &HashMap<String, Arc<Snapshot>>,
    error_handling: ErrorHandling,
) -> f64 {
    let mut values = Vec::with_capacity(source_ids.len());
    for id in source_ids {
        let value = raw
            .get(id)
            .and_then(|snap| snap.values.get(&field.name).copied())
            .unwrap_or(MISSING);
        if is_missing(value) {
            warn!(field = %field.name, device = %id, "source field read failed");
            if error_handling == ErrorHandling::FailFast {
                return MISSING;
            }
        } else {
            values.push(value);
        }
    }
    if values.is_empty() {
        return MISSING;
    }
    match field.method {
        AggregationMethod::Sum => values.iter().sum(),
        AggregationMethod::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggregationMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregationMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregationMethod::CalculatedPf => MISSING,
    }
}

/// PF = Kw / Kva from the aggregated totals; 0 when Kva is 0; clamped ±1.
fn calculate_power_factor(values: &indexmap::IndexMap<String, f64>) -> f64 {
    let kw = values.get("Kw").copied().unwrap_or(MISSING);
    let kva = values.get("Kva").copied().unwrap_or(MISSING);
    if is_missing(kw) || is_missing(kva) {
        warn!("cannot calculate power factor: Kw or Kva missing");
        return MISSING;
    }
    if kva == 0.0 {
        warn!("cannot calculate power factor: Kva is 0");
        return 0.0;
    }
    let pf = kw / kva;
    if pf.abs() > 1.0 {
        warn!(pf, "abnormal power factor, capping to ±1");
        return pf.signum();
    }
    pf
}

#[cfg(test)]
#[path = "virtual_device_tests.rs"]
mod tests;
