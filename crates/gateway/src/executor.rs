// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Applies control actions to devices, in order, with per-target priority
//! arbitration.
//!
//! Within one execution pass a target written by a higher-priority rule is
//! protected: equal-or-lower priority writes are skipped and logged
//! `[PROTECTED]`. A higher-priority overwrite of a differing value logs
//! `[OVERWRITE]` and proceeds. One action's failure never aborts the list.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::control::{ActionType, ControlAction};
use crate::device::Device;
use crate::health::HealthManager;
use crate::manager::DeviceManager;
use crate::registers::REG_RW_ON_OFF;
use crate::snapshot::is_missing;

/// Numeric equality tolerance for skip-if-already-set checks.
const VALUE_TOLERANCE: f64 = 0.0;

struct WrittenTarget {
    value: f64,
    priority: u32,
    rule_code: String,
}

pub struct ControlExecutor {
    devices: Arc<DeviceManager>,
    health: Option<Arc<HealthManager>>,
}

impl ControlExecutor {
    pub fn new(devices: Arc<DeviceManager>, health: Option<Arc<HealthManager>>) -> Self {
        Self { devices, health }
    }

    /// Execute actions sequentially in evaluator order.
    pub async fn execute(&self, actions: &[ControlAction]) {
        let mut written: HashMap<String, WrittenTarget> = HashMap::new();

        for action in actions {
            let device_id = action.device_id();

            if let Some(health) = &self.health {
                if !health.is_healthy(&device_id) {
                    debug!(
                        device = %device_id,
                        action = action.action_type.as_str(),
                        "[SKIP] device offline"
                    );
                    continue;
                }
            }

            let Some(device) = self.devices.get_device(&action.model, action.slave_id) else {
                warn!(device = %device_id, "[SKIP] device not found. {}", action.reason);
                continue;
            };

            match action.action_type {
                ActionType::TurnOn | ActionType::TurnOff => {
                    self.execute_on_off(&device, action, &mut written).await;
                }
                ActionType::AdjustFrequency => {
                    self.execute_adjust(&device, action, &mut written).await;
                }
                ActionType::SetFrequency | ActionType::WriteDo | ActionType::Reset => {
                    self.execute_write(&device, action, &mut written).await;
                }
            }
        }
    }

    async fn execute_on_off(
        &self,
        device: &Arc<Device>,
        action: &ControlAction,
        written: &mut HashMap<String, WrittenTarget>,
    ) {
        if !device.supports_on_off() {
            info!(model = %device.model, "[SKIP] device does not support ON/OFF. {}", action.reason);
            return;
        }
        let desired = if action.action_type == ActionType::TurnOn { 1.0 } else { 0.0 };
        let target_key = format!("{}_{}", action.device_id(), REG_RW_ON_OFF);

        if self.is_protected(&target_key, desired, action, written) {
            return;
        }

        // Read the current state to avoid a redundant write; on a read
        // failure the write proceeds anyway.
        let current = device.read_value(REG_RW_ON_OFF).await;
        if !is_missing(current) && current == desired {
            info!(model = %device.model, "[SKIP] {REG_RW_ON_OFF} already {desired}. {}", action.reason);
            return;
        }

        match device.write_on_off(desired == 1.0).await {
            Ok(()) => {
                info!(model = %device.model, "[WRITE] {REG_RW_ON_OFF} => {desired}. {}", action.reason);
                self.record(written, target_key, desired, action);
            }
            Err(e) => {
                warn!(model = %device.model, "[FAIL] {REG_RW_ON_OFF}: {e}. {}", action.reason);
            }
        }
    }

    async fn execute_adjust(
        &self,
        device: &Arc<Device>,
        action: &ControlAction,
        written: &mut HashMap<String, WrittenTarget>,
    ) {
        let Some(target) = action.target.as_deref() else {
            warn!(model = %device.model, "[SKIP] missing target for adjust_frequency. {}", action.reason);
            return;
        };
        if !device.has_register(target) {
            info!(model = %device.model, "[SKIP] no such register: {target}. {}", action.reason);
            return;
        }
        if !device.is_register_writable(target) {
            info!(model = %device.model, "[SKIP] {target} is not writable. {}", action.reason);
            return;
        }
        let Some(delta) = action.value else {
            warn!(model = %device.model, "[SKIP] missing adjustment value. {}", action.reason);
            return;
        };
        if delta.abs() <= VALUE_TOLERANCE {
            info!(model = %device.model, "[SKIP] adjustment too small: {delta}. {}", action.reason);
            return;
        }

        let current = device.read_value(target).await;
        if is_missing(current) {
            warn!(model = %device.model, "[FAIL] cannot read {target} before adjust. {}", action.reason);
            return;
        }
        let new_value = current + delta;

        let target_key = format!("{}_{target}", action.device_id());
        if self.is_protected(&target_key, new_value, action, written) {
            return;
        }

        match device.write_value(target, new_value).await {
            Ok(()) => {
                info!(
                    model = %device.model,
                    "[ADJUST] {target}: {current} + {delta} = {new_value}. {}",
                    action.reason
                );
                self.record(written, target_key, new_value, action);
            }
            Err(e) => {
                warn!(
                    model = %device.model,
                    "[FAIL] cannot write {target} to {new_value}: {e}. {}",
                    action.reason
                );
            }
        }
    }

    async fn execute_write(
        &self,
        device: &Arc<Device>,
        action: &ControlAction,
        written: &mut HashMap<String, WrittenTarget>,
    ) {
        let Some(target) = action.target.as_deref() else {
            warn!(
                model = %device.model,
                "[SKIP] missing target for {}. {}",
                action.action_type.as_str(),
                action.reason
            );
            return;
        };
        if !device.has_register(target) {
            info!(model = %device.model, "[SKIP] no such register: {target}. {}", action.reason);
            return;
        }
        if !device.is_register_writable(target) {
            info!(model = %device.model, "[SKIP] {target} is not writable. {}", action.reason);
            return;
        }
        let Some(value) = action.value else {
            warn!(model = %device.model, "[SKIP] {target} missing value. {}", action.reason);
            return;
        };

        let target_key = format!("{}_{target}", action.device_id());
        if self.is_protected(&target_key, value, action, written) {
            return;
        }

        // Skip redundant writes; a failed read falls through to the write.
        let current = device.read_value(target).await;
        if !is_missing(current) && (current - value).abs() <= VALUE_TOLERANCE {
            info!(model = %device.model, "[SKIP] {target} already {value}. {}", action.reason);
            return;
        }

        match device.write_value(target, value).await {
            Ok(()) => {
                info!(model = %device.model, "[WRITE] {target} => {value}. {}", action.reason);
                self.record(written, target_key, value, action);
            }
            Err(e) => {
                warn!(model = %device.model, "[FAIL] {target} => {value}: {e}. {}", action.reason);
            }
        }
    }

    /// Whether the target was already written by a strictly higher-priority
    /// rule this pass. Logs `[PROTECTED]` / `[OVERWRITE]` accordingly.
    fn is_protected(
        &self,
        target_key: &str,
        new_value: f64,
        action: &ControlAction,
        written: &HashMap<String, WrittenTarget>,
    ) -> bool {
        let Some(previous) = written.get(target_key) else {
            return false;
        };
        if previous.priority < action.priority {
            warn!(
                target = target_key,
                "[PROTECTED] already set to {} by higher priority rule {} (p={}), skipping p={}. {}",
                previous.value,
                previous.rule_code,
                previous.priority,
                action.priority,
                action.reason
            );
            return true;
        }
        if previous.value != new_value {
            warn!(
                target = target_key,
                "[OVERWRITE] replacing {} from {} (p={}) with {} (p={}). {}",
                previous.value,
                previous.rule_code,
                previous.priority,
                new_value,
                action.priority,
                action.reason
            );
        }
        false
    }

    fn record(
        &self,
        written: &mut HashMap<String, WrittenTarget>,
        target_key: String,
        value: f64,
        action: &ControlAction,
    ) {
        written.insert(
            target_key,
            WrittenTarget {
                value,
                priority: action.priority,
                rule_code: action.rule_code().to_owned(),
            },
        );
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
