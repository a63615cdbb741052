// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pin-level device access on top of the bus layer.
//!
//! Translates a register map into bulk reads, per-pin reads, and writes.
//! Bulk grouping covers contiguous holding/input pins; coils, discrete
//! inputs, composed values, and dynamically scaled pins fall back to
//! per-pin reads.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::bus::{Bus, SharedPort};
use crate::health::HealthCheckConfig;
use crate::registers::{
    self, ComputedMethod, RegisterMap, RegisterSpec, RegisterType, REG_RW_ON_OFF,
};
use crate::snapshot::{is_missing, MISSING};

/// Upper bound on registers per bulk request.
const MAX_REGS_PER_REQUEST: u16 = 120;

/// Per-pin write limits loaded from instance configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConstraintPolicy {
    #[serde(default)]
    pub limits: HashMap<String, ValueRange>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct ValueRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ConstraintPolicy {
    /// Whether a write of `value` to `pin` is inside the configured range.
    pub fn allow(&self, pin: &str, value: f64) -> bool {
        let Some(range) = self.limits.get(pin) else {
            return true;
        };
        if let Some(min) = range.min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = range.max {
            if value > max {
                return false;
            }
        }
        true
    }

    pub fn range(&self, pin: &str) -> Option<ValueRange> {
        self.limits.get(pin).copied()
    }
}

/// A contiguous run of bulk-eligible pins sharing one register type.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRange {
    pub register_type: RegisterType,
    pub start: u16,
    pub count: u16,
    pub pins: Vec<String>,
}

/// One Modbus slave with its register map.
pub struct Device {
    pub model: String,
    pub slave_id: u8,
    pub device_type: String,
    pub register_type: RegisterType,
    pub register_map: RegisterMap,
    pub port_id: String,
    port: SharedPort,
    buses: parking_lot::Mutex<HashMap<RegisterType, Arc<Bus>>>,
    constraints: ConstraintPolicy,
    scale_cache: parking_lot::Mutex<HashMap<String, f64>>,
    health_check: Option<HealthCheckConfig>,
}

impl Device {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: &str,
        slave_id: u8,
        device_type: &str,
        register_type: RegisterType,
        register_map: RegisterMap,
        port_id: &str,
        port: SharedPort,
        constraints: ConstraintPolicy,
        health_check: Option<HealthCheckConfig>,
    ) -> Self {
        let default_bus = Arc::new(Bus::new(Arc::clone(&port), slave_id, register_type));
        let mut buses = HashMap::new();
        buses.insert(register_type, default_bus);
        Self {
            model: model.to_owned(),
            slave_id,
            device_type: device_type.to_owned(),
            register_type,
            register_map,
            port_id: port_id.to_owned(),
            port,
            buses: parking_lot::Mutex::new(buses),
            constraints,
            scale_cache: parking_lot::Mutex::new(HashMap::new()),
            health_check,
        }
    }

    pub fn device_id(&self) -> String {
        crate::snapshot::device_id(&self.model, self.slave_id)
    }

    pub fn health_check_config(&self) -> Option<&HealthCheckConfig> {
        self.health_check.as_ref()
    }

    // ---- capability interface (used by the control executor) ----

    pub fn has_register(&self, name: &str) -> bool {
        self.register_map.pins.contains_key(name)
    }

    pub fn is_register_writable(&self, name: &str) -> bool {
        self.register_map.get(name).map(|spec| spec.writable).unwrap_or(false)
    }

    pub fn supports_on_off(&self) -> bool {
        if let Some(spec) = self.register_map.get(REG_RW_ON_OFF) {
            if spec.writable {
                return true;
            }
        }
        matches!(
            self.device_type.to_lowercase().as_str(),
            "inverter" | "vfd" | "inverter_vfd"
        )
    }

    // ---- reads ----

    /// Bulk snapshot of every readable pin. One Modbus request per contiguous
    /// range; a failed range yields the missing sentinel for each covered
    /// pin. Computed fields are resolved last.
    pub async fn read_all(&self) -> IndexMap<String, f64> {
        if !self.default_bus().ensure_connected().await {
            warn!(device = %self.device_id(), "port not connected, returning offline snapshot");
            return self.offline_snapshot();
        }

        let mut result: IndexMap<String, f64> = IndexMap::new();

        for range in self.build_bulk_ranges(MAX_REGS_PER_REQUEST) {
            let bus = self.bus_for(range.register_type);
            match bus.read_regs(range.start, range.count).await {
                Some(words) => {
                    for pin_name in &range.pins {
                        let Some(spec) = self.register_map.get(pin_name) else {
                            continue;
                        };
                        let rel = (spec.offset - range.start) as usize;
                        let word_count = spec.format.word_count() as usize;
                        let value = words
                            .get(rel..rel + word_count)
                            .and_then(|slice| registers::decode_words(spec.format, slice))
                            .map(|raw| registers::post_process(spec, raw))
                            .unwrap_or(MISSING);
                        result.insert(pin_name.clone(), value);
                    }
                }
                None => {
                    warn!(
                        device = %self.device_id(),
                        register_type = range.register_type.as_str(),
                        start = range.start,
                        count = range.count,
                        "bulk read failed"
                    );
                    for pin_name in &range.pins {
                        result.insert(pin_name.clone(), MISSING);
                    }
                }
            }
        }

        // Fallback pins: coils, discrete inputs, composed values, dynamic
        // scale, and anything else the bulk pass skipped.
        let fallback: Vec<String> = self
            .register_map
            .readable_pins()
            .filter(|(name, _)| !result.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in fallback {
            let value = self.read_value(&name).await;
            result.insert(name, value);
        }

        self.apply_computed_fields(&mut result);
        result
    }

    /// Read one pin, applying the full decode pipeline.
    pub async fn read_value(&self, name: &str) -> f64 {
        let Some(spec) = self.register_map.get(name) else {
            warn!(device = %self.device_id(), pin = name, "unknown pin");
            return MISSING;
        };
        if !spec.readable {
            warn!(device = %self.device_id(), pin = name, "pin is not readable");
            return MISSING;
        }

        let pin_type = spec.register_type.unwrap_or(self.register_type);
        let bus = self.bus_for(pin_type);

        let raw = if pin_type.is_bit_type() {
            match bus.read_bit(spec.offset).await {
                Some(on) => {
                    if on {
                        1.0
                    } else {
                        0.0
                    }
                }
                None => {
                    warn!(device = %self.device_id(), pin = name, offset = spec.offset, "bit read failed");
                    return MISSING;
                }
            }
        } else if spec.composed_of.is_some() {
            match self.read_composed(spec).await {
                Some(value) => value,
                None => return MISSING,
            }
        } else {
            let word_count = spec.format.word_count();
            match bus.read_regs(spec.offset, word_count).await {
                Some(words) => match registers::decode_words(spec.format, &words) {
                    Some(value) => value,
                    None => {
                        warn!(device = %self.device_id(), pin = name, "short register payload");
                        return MISSING;
                    }
                },
                None => {
                    warn!(
                        device = %self.device_id(),
                        pin = name,
                        offset = spec.offset,
                        "read failed, device may not support this feature"
                    );
                    return MISSING;
                }
            }
        };

        let mut value = registers::post_process(spec, raw);
        if let Some(table) = &spec.scale_from {
            value *= self.resolve_dynamic_scale(table).await;
            if let Some(precision) = spec.precision {
                value = registers::round_to(value, precision);
            }
        }
        value
    }

    async fn read_composed(&self, spec: &RegisterSpec) -> Option<f64> {
        let parts = spec.composed_of.as_ref()?;
        let bus = self.default_bus();
        let mut words = [0u64; 3];
        for (i, part) in parts.iter().enumerate() {
            let Some(part_spec) = self.register_map.get(part) else {
                warn!(device = %self.device_id(), pin = part, "composed_of part missing");
                return None;
            };
            let word = bus.read_u16(part_spec.offset).await?;
            words[i] = u64::from(word);
        }
        // HI | MD | LO, each 16 bits wide.
        Some(((words[0] << 32) | (words[1] << 16) | words[2]) as f64)
    }

    /// Look up the dynamic scale factor through the table's index register.
    /// Cached until a write invalidates it.
    async fn resolve_dynamic_scale(&self, table: &str) -> f64 {
        if let Some(cached) = self.scale_cache.lock().get(table) {
            return *cached;
        }
        let Some(entry) = self.register_map.scale_tables.get(table) else {
            warn!(device = %self.device_id(), table, "unknown scale table");
            return 1.0;
        };
        let Some(index_spec) = self.register_map.get(&entry.index_pin) else {
            warn!(device = %self.device_id(), table, "scale index pin missing");
            return 1.0;
        };
        let Some(index) = self.default_bus().read_u16(index_spec.offset).await else {
            warn!(device = %self.device_id(), table, "scale index read failed");
            return 1.0;
        };
        let factor = entry.factors.get(index as usize).copied().unwrap_or_else(|| {
            warn!(device = %self.device_id(), table, index, "scale index out of table range");
            1.0
        });
        self.scale_cache.lock().insert(table.to_owned(), factor);
        factor
    }

    // ---- writes ----

    /// Write one pin. Bit pins use read-modify-write on the containing word;
    /// coil pins write the coil directly; everything else writes the scaled
    /// raw word.
    pub async fn write_value(&self, name: &str, value: f64) -> anyhow::Result<()> {
        let Some(spec) = self.register_map.get(name) else {
            anyhow::bail!("pin '{name}' is not defined for {}", self.model);
        };
        if !spec.writable {
            anyhow::bail!("pin '{name}' is not writable for {}", self.model);
        }
        if !self.constraints.allow(name, value) {
            warn!(device = %self.device_id(), pin = name, value, "write blocked by constraint");
            return Ok(());
        }

        let spec = spec.clone();
        let pin_type = spec.register_type.unwrap_or(self.register_type);
        if pin_type == RegisterType::Coil {
            let on = value != 0.0;
            let bus = self.bus_for(pin_type);
            if !bus.write_coil(spec.offset, on).await {
                anyhow::bail!("coil write failed for '{name}'");
            }
            info!(device = %self.device_id(), pin = name, offset = spec.offset, on, "coil written");
            self.on_write(name);
            return Ok(());
        }

        if let Some(bit) = spec.bit {
            return self.write_bit(name, &spec, bit, value != 0.0).await;
        }

        let raw = self.scaled_raw_value(&spec, value);
        if !self.default_bus().write_u16(spec.offset, raw).await {
            anyhow::bail!("register write failed for '{name}'");
        }
        info!(device = %self.device_id(), pin = name, offset = spec.offset, raw, "register written");
        self.on_write(name);
        Ok(())
    }

    /// Set or clear one bit of a 16-bit register via read-modify-write. The
    /// port mutex serializes each bus call, and a stale interleaving write
    /// would come from this same executor, which is sequential.
    async fn write_bit(
        &self,
        name: &str,
        spec: &RegisterSpec,
        bit: u8,
        on: bool,
    ) -> anyhow::Result<()> {
        let bus = self.default_bus();
        let Some(current) = bus.read_u16(spec.offset).await else {
            warn!(device = %self.device_id(), pin = name, "read before bit-write failed");
            return Ok(());
        };
        let new_word = if on { current | (1 << bit) } else { current & !(1 << bit) };
        if !bus.write_u16(spec.offset, new_word).await {
            anyhow::bail!("bit write failed for '{name}'");
        }
        info!(
            device = %self.device_id(),
            pin = name,
            bit,
            from = %format!("{current:#06x}"),
            to = %format!("{new_word:#06x}"),
            "bit written"
        );
        self.on_write(name);
        Ok(())
    }

    /// Write the on/off control word, when defined and writable.
    pub async fn write_on_off(&self, on: bool) -> anyhow::Result<()> {
        let writable = self
            .register_map
            .get(REG_RW_ON_OFF)
            .map(|spec| spec.writable)
            .unwrap_or(false);
        if !writable {
            warn!(device = %self.device_id(), "{REG_RW_ON_OFF} not writable or not defined, skipping");
            return Ok(());
        }
        self.write_value(REG_RW_ON_OFF, if on { 1.0 } else { 0.0 }).await
    }

    fn on_write(&self, pin: &str) {
        // A write to a scale-index register invalidates the cached factor.
        let stale: Vec<String> = self
            .register_map
            .scale_tables
            .iter()
            .filter(|(_, entry)| entry.index_pin == pin)
            .map(|(table, _)| table.clone())
            .collect();
        if !stale.is_empty() {
            let mut cache = self.scale_cache.lock();
            for table in stale {
                debug!(device = %self.device_id(), table, "scale cache invalidated");
                cache.remove(&table);
            }
        }
    }

    // ---- grouping & helpers ----

    fn is_bulk_eligible(&self, spec: &RegisterSpec) -> bool {
        if !spec.readable {
            return false;
        }
        let pin_type = spec.register_type.unwrap_or(self.register_type);
        if pin_type.is_bit_type() {
            return false;
        }
        if spec.composed_of.is_some() || spec.scale_from.is_some() {
            return false;
        }
        true
    }

    /// Partition bulk-eligible pins into contiguous same-type ranges no wider
    /// than `max_regs`.
    pub fn build_bulk_ranges(&self, max_regs: u16) -> Vec<BulkRange> {
        let mut candidates: Vec<(&String, &RegisterSpec, RegisterType)> = self
            .register_map
            .pins
            .iter()
            .filter(|(_, spec)| self.is_bulk_eligible(spec))
            .map(|(name, spec)| (name, spec, spec.register_type.unwrap_or(self.register_type)))
            .collect();
        candidates.sort_by_key(|(_, spec, kind)| (*kind, spec.offset));

        let mut ranges: Vec<BulkRange> = Vec::new();
        for (name, spec, kind) in candidates {
            let word_count = spec.format.word_count();
            let end = spec.offset + word_count;

            match ranges.last_mut() {
                Some(range)
                    if range.register_type == kind
                        && spec.offset == range.start + range.count
                        && end - range.start <= max_regs =>
                {
                    range.count = end - range.start;
                    range.pins.push(name.clone());
                }
                _ => {
                    ranges.push(BulkRange {
                        register_type: kind,
                        start: spec.offset,
                        count: word_count,
                        pins: vec![name.clone()],
                    });
                }
            }
        }
        ranges
    }

    fn apply_computed_fields(&self, values: &mut IndexMap<String, f64>) {
        for (name, field) in &self.register_map.computed {
            let sources: Vec<f64> = field
                .sources
                .iter()
                .map(|src| values.get(src).copied().unwrap_or(MISSING))
                .collect();
            let value = if sources.is_empty() || sources.iter().any(|v| is_missing(*v)) {
                MISSING
            } else {
                let computed = match field.method {
                    ComputedMethod::Sum => sources.iter().sum(),
                    ComputedMethod::Average => sources.iter().sum::<f64>() / sources.len() as f64,
                    ComputedMethod::Min => sources.iter().copied().fold(f64::INFINITY, f64::min),
                    ComputedMethod::Max => {
                        sources.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                    }
                    ComputedMethod::Difference => {
                        if sources.len() == 2 {
                            sources[0] - sources[1]
                        } else {
                            MISSING
                        }
                    }
                };
                match field.precision {
                    Some(p) if !is_missing(computed) => registers::round_to(computed, p),
                    _ => computed,
                }
            };
            values.insert(name.clone(), value);
        }
    }

    /// Snapshot used when the port cannot be opened at all.
    pub fn offline_snapshot(&self) -> IndexMap<String, f64> {
        self.register_map
            .readable_pins()
            .map(|(name, _)| (name.clone(), MISSING))
            .collect()
    }

    fn scaled_raw_value(&self, spec: &RegisterSpec, value: f64) -> u16 {
        let scale = if spec.scale == 0.0 { 1.0 } else { spec.scale };
        (value / scale).round().clamp(0.0, f64::from(u16::MAX)) as u16
    }

    fn default_bus(&self) -> Arc<Bus> {
        self.bus_for(self.register_type)
    }

    fn bus_for(&self, register_type: RegisterType) -> Arc<Bus> {
        let mut buses = self.buses.lock();
        Arc::clone(buses.entry(register_type).or_insert_with(|| {
            debug!(
                device = %crate::snapshot::device_id(&self.model, self.slave_id),
                register_type = register_type.as_str(),
                "bus created for register type"
            );
            Arc::new(Bus::new(Arc::clone(&self.port), self.slave_id, register_type))
        }))
    }
}

#[cfg(test)]
#[path = "device_tests.rs"]
mod tests;
