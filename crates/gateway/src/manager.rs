// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device construction and port ownership.
//!
//! One `SharedPort` exists per physical serial device; every logical bus for
//! that segment shares its mutex. Devices are immutable after construction.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::bus::{shared_port, SharedPort};
use crate::control::ConstraintConfig;
use crate::device::{ConstraintPolicy, Device};
use crate::health::HealthCheckConfig;
use crate::link::{SerialLink, SerialSettings};
use crate::registers::{RegisterMap, RegisterType};

/// One device model definition: register map plus defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub device_type: String,
    #[serde(default = "default_register_type")]
    pub register_type: RegisterType,
    pub register_map: RegisterMap,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

fn default_register_type() -> RegisterType {
    RegisterType::Holding
}

/// One deployed device instance.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub model: String,
    pub slave_id: u8,
    pub port: String,
}

/// Full device configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub ports: HashMap<String, SerialSettings>,
    pub models: HashMap<String, ModelConfig>,
    pub instances: Vec<InstanceConfig>,
}

/// Owns all devices and their shared ports.
pub struct DeviceManager {
    devices: Vec<Arc<Device>>,
    by_id: HashMap<String, Arc<Device>>,
    ports: HashMap<String, SharedPort>,
}

impl DeviceManager {
    /// Build devices from configuration. Instances that fail validation are
    /// skipped with a warning; the rest of the fleet still comes up.
    pub fn from_config(
        config: DeviceConfig,
        constraints: &ConstraintConfig,
    ) -> anyhow::Result<Self> {
        let mut ports: HashMap<String, SharedPort> = HashMap::new();
        for (port_id, settings) in &config.ports {
            let link = SerialLink::new(settings.clone());
            ports.insert(port_id.clone(), shared_port(Box::new(link)));
        }

        let mut devices = Vec::new();
        let mut by_id = HashMap::new();

        for instance in &config.instances {
            if !(1..=247).contains(&instance.slave_id) {
                warn!(
                    model = %instance.model,
                    slave_id = instance.slave_id,
                    "slave id out of range 1..247, skipping instance"
                );
                continue;
            }
            let Some(model) = config.models.get(&instance.model) else {
                warn!(model = %instance.model, "unknown model, skipping instance");
                continue;
            };
            let Some(port) = ports.get(&instance.port) else {
                warn!(
                    model = %instance.model,
                    port = %instance.port,
                    "unknown port, skipping instance"
                );
                continue;
            };
            if let Err(e) = model.register_map.validate() {
                warn!(model = %instance.model, "invalid register map, skipping instance: {e}");
                continue;
            }

            let device = Arc::new(Device::new(
                &instance.model,
                instance.slave_id,
                &model.device_type,
                model.register_type,
                model.register_map.clone(),
                &instance.port,
                Arc::clone(port),
                constraint_policy_for(constraints, &instance.model, instance.slave_id),
                model.health_check.clone(),
            ));
            by_id.insert(device.device_id(), Arc::clone(&device));
            devices.push(device);
        }

        info!(devices = devices.len(), ports = ports.len(), "device manager initialized");
        Ok(Self { devices, by_id, ports })
    }

    /// Test/bench constructor from prebuilt devices.
    pub fn from_devices(devices: Vec<Arc<Device>>) -> Self {
        let by_id = devices.iter().map(|d| (d.device_id(), Arc::clone(d))).collect();
        Self { devices, by_id, ports: HashMap::new() }
    }

    pub fn device_list(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device_ids(&self) -> std::collections::HashSet<String> {
        self.by_id.keys().cloned().collect()
    }

    pub fn get_device(&self, model: &str, slave_id: u8) -> Option<Arc<Device>> {
        self.get_device_by_id(&crate::snapshot::device_id(model, slave_id))
    }

    pub fn get_device_by_id(&self, device_id: &str) -> Option<Arc<Device>> {
        self.by_id.get(device_id).cloned()
    }

    /// Highest slave id across all devices, for auto-assigned virtual ids.
    pub fn max_slave_id(&self) -> u8 {
        self.devices.iter().map(|d| d.slave_id).max().unwrap_or(0)
    }

    /// Open every port once, best effort. Devices on a port that will not
    /// open stay registered and report offline snapshots.
    pub async fn init(&self) {
        for (port_id, port) in &self.ports {
            let mut state = port.lock().await;
            if let Err(e) = state.open().await {
                warn!(port = %port_id, "port open failed at startup: {e}");
            }
        }
    }

    /// Close every port.
    pub async fn shutdown(&self) {
        for (port_id, port) in &self.ports {
            let mut state = port.lock().await;
            state.close().await;
            info!(port = %port_id, "port closed");
        }
    }
}

/// Collapse the constraint configuration into a per-device write policy.
fn constraint_policy_for(
    constraints: &ConstraintConfig,
    model: &str,
    slave_id: u8,
) -> ConstraintPolicy {
    let mut limits = HashMap::new();
    if let Some(model_constraints) = constraints.get(model) {
        for (pin, range) in &model_constraints.default_constraints {
            limits.insert(pin.clone(), *range);
        }
        if let Some(instance) = model_constraints.instances.get(&slave_id.to_string()) {
            for (pin, range) in &instance.constraints {
                limits.insert(pin.clone(), *range);
            }
        }
    }
    ConstraintPolicy { limits }
}
