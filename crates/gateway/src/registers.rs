// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Register map model and word decoding.
//!
//! A register map is loaded from configuration and is immutable at runtime.
//! Decoding applies, in order: format decode, bit extraction, linear formula,
//! constant scale, dynamic scale, precision rounding.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Pin name conventionally used for the on/off control word.
pub const REG_RW_ON_OFF: &str = "RW_ON_OFF";

/// Modbus register class. Determines the read/write function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    DiscreteInput,
}

impl RegisterType {
    /// Coils and discrete inputs carry bits, not 16-bit words.
    pub fn is_bit_type(&self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Holding => "holding",
            Self::Input => "input",
            Self::Coil => "coil",
            Self::DiscreteInput => "discrete_input",
        }
    }
}

/// On-wire word layout of a register value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordFormat {
    #[default]
    U16,
    I16,
    U32Le,
    U32Be,
    F32Le,
    F32Be,
    F32BeSwap,
}

impl WordFormat {
    /// Number of 16-bit words the format occupies.
    pub fn word_count(&self) -> u16 {
        match self {
            Self::U16 | Self::I16 => 1,
            Self::U32Le | Self::U32Be | Self::F32Le | Self::F32Be | Self::F32BeSwap => 2,
        }
    }
}

fn default_scale() -> f64 {
    1.0
}

/// One pin of a device register map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSpec {
    #[serde(default)]
    pub offset: u16,
    /// Overrides the device-level register type for this pin.
    #[serde(default)]
    pub register_type: Option<RegisterType>,
    #[serde(default)]
    pub format: WordFormat,
    /// Bit index (0..15) extracted after decoding, holding/input only.
    #[serde(default)]
    pub bit: Option<u8>,
    #[serde(default)]
    pub readable: bool,
    #[serde(default)]
    pub writable: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Linear formula `y = a*x + b` applied before scaling.
    #[serde(default)]
    pub formula: Option<(f64, f64)>,
    #[serde(default)]
    pub precision: Option<u32>,
    /// Name of a scale table whose factor multiplies the decoded value.
    #[serde(default)]
    pub scale_from: Option<String>,
    /// HI|MD|LO pin names combined into one 48-bit value.
    #[serde(default)]
    pub composed_of: Option<[String; 3]>,
}

/// Aggregation method for a computed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputedMethod {
    Sum,
    Average,
    Min,
    Max,
    Difference,
}

/// A field derived from other resolved pin values after the read completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedField {
    pub method: ComputedMethod,
    pub sources: Vec<String>,
    #[serde(default)]
    pub precision: Option<u32>,
}

/// Dynamic scale factor lookup: a 16-bit index register selects the factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleTable {
    pub index_pin: String,
    pub factors: Vec<f64>,
}

/// Full register map of a device model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterMap {
    pub pins: IndexMap<String, RegisterSpec>,
    #[serde(default)]
    pub computed: IndexMap<String, ComputedField>,
    #[serde(default)]
    pub scale_tables: IndexMap<String, ScaleTable>,
}

impl RegisterMap {
    pub fn get(&self, name: &str) -> Option<&RegisterSpec> {
        self.pins.get(name)
    }

    pub fn readable_pins(&self) -> impl Iterator<Item = (&String, &RegisterSpec)> {
        self.pins.iter().filter(|(_, spec)| spec.readable)
    }

    /// Validate internal references: composed_of, scale_from, and computed
    /// sources must resolve within the same map.
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        for (name, spec) in &self.pins {
            if let Some(parts) = &spec.composed_of {
                for part in parts {
                    if !self.pins.contains_key(part) {
                        return Err(crate::error::ConfigError::Invalid(format!(
                            "pin '{name}': composed_of references unknown pin '{part}'"
                        )));
                    }
                }
            }
            if let Some(table) = &spec.scale_from {
                let Some(entry) = self.scale_tables.get(table) else {
                    return Err(crate::error::ConfigError::Invalid(format!(
                        "pin '{name}': unknown scale table '{table}'"
                    )));
                };
                if !self.pins.contains_key(&entry.index_pin) {
                    return Err(crate::error::ConfigError::Invalid(format!(
                        "scale table '{table}': unknown index pin '{}'",
                        entry.index_pin
                    )));
                }
            }
            if let Some(bit) = spec.bit {
                if bit > 15 {
                    return Err(crate::error::ConfigError::Invalid(format!(
                        "pin '{name}': bit index {bit} out of range"
                    )));
                }
            }
        }
        for (name, field) in &self.computed {
            for source in &field.sources {
                if !self.pins.contains_key(source) && !self.computed.contains_key(source) {
                    return Err(crate::error::ConfigError::Invalid(format!(
                        "computed field '{name}': unknown source '{source}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Decode raw register words into a numeric value according to the format.
///
/// Returns `None` when too few words were supplied.
pub fn decode_words(format: WordFormat, words: &[u16]) -> Option<f64> {
    if words.len() < format.word_count() as usize {
        return None;
    }
    let value = match format {
        WordFormat::U16 => f64::from(words[0]),
        WordFormat::I16 => f64::from(words[0] as i16),
        WordFormat::U32Be => f64::from((u32::from(words[0]) << 16) | u32::from(words[1])),
        WordFormat::U32Le => f64::from((u32::from(words[1]) << 16) | u32::from(words[0])),
        WordFormat::F32Be => {
            f64::from(f32::from_bits((u32::from(words[0]) << 16) | u32::from(words[1])))
        }
        WordFormat::F32Le => {
            f64::from(f32::from_bits((u32::from(words[1]) << 16) | u32::from(words[0])))
        }
        WordFormat::F32BeSwap => f64::from(f32::from_bits(
            (u32::from(words[0].swap_bytes()) << 16) | u32::from(words[1].swap_bytes()),
        )),
    };
    Some(value)
}

/// Extract a single bit from the integer part of a decoded value.
pub fn extract_bit(value: f64, bit: u8) -> f64 {
    let word = value as i64;
    f64::from(((word >> bit) & 1) as i32)
}

/// Apply the linear formula `y = a*x + b`.
pub fn apply_formula(value: f64, formula: (f64, f64)) -> f64 {
    formula.0 * value + formula.1
}

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Post-decode processing common to bulk and per-pin reads. Dynamic scale is
/// applied by the caller because it requires another bus read.
pub fn post_process(spec: &RegisterSpec, mut value: f64) -> f64 {
    if let Some(bit) = spec.bit {
        value = extract_bit(value, bit);
    }
    if let Some(formula) = spec.formula {
        value = apply_formula(value, formula);
    }
    value *= spec.scale;
    if spec.scale_from.is_none() {
        if let Some(precision) = spec.precision {
            value = round_to(value, precision);
        }
    }
    value
}

#[cfg(test)]
#[path = "registers_tests.rs"]
mod tests;
