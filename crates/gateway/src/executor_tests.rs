// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::bus::shared_port;
use crate::device::ConstraintPolicy;
use crate::health::{HealthConfig, HealthManager};
use crate::registers::{RegisterMap, RegisterType};
use crate::test_support::{rw_pin, FakeLink, FakeLinkState};

fn vfd_device(slave_id: u8) -> (Arc<Device>, Arc<FakeLinkState>) {
    let mut map = RegisterMap::default();
    map.pins.insert("RW_HZ".to_owned(), rw_pin(16));
    map.pins.insert("RW_ON_OFF".to_owned(), rw_pin(0));
    map.pins.insert("RO_STATUS".to_owned(), crate::test_support::holding_pin(5));
    let (link, state) = FakeLink::new();
    let device = Arc::new(Device::new(
        "TECO_VFD",
        slave_id,
        "inverter",
        RegisterType::Holding,
        map,
        "/dev/ttyUSB0",
        shared_port(Box::new(link)),
        ConstraintPolicy::default(),
        None,
    ));
    (device, state)
}

fn action(
    slave_id: u8,
    action_type: ActionType,
    target: Option<&str>,
    value: Option<f64>,
    priority: u32,
    code: &str,
) -> ControlAction {
    ControlAction {
        model: "TECO_VFD".to_owned(),
        slave_id,
        action_type,
        target: target.map(str::to_owned),
        value,
        priority,
        reason: format!("[{code}] rule {code}"),
        emergency_override: false,
    }
}

#[tokio::test(start_paused = true)]
async fn writes_resolved_value() {
    let (device, state) = vfd_device(1);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[action(1, ActionType::SetFrequency, Some("RW_HZ"), Some(50.0), 90, "SET")])
        .await;

    assert_eq!(state.word(1, RegisterType::Holding, 16), Some(50));
}

#[tokio::test(start_paused = true)]
async fn same_target_priority_arbitration() {
    // Two rules target TECO_VFD_1 / RW_HZ: priority 95 sets 60 Hz, priority
    // 151 sets 30 Hz. The evaluator emits higher priority (lower number)
    // first; the later, lower-priority write is protected and skipped, so
    // 60 Hz stands.
    let (device, state) = vfd_device(1);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[
            action(1, ActionType::SetFrequency, Some("RW_HZ"), Some(60.0), 95, "RULE_A"),
            action(1, ActionType::SetFrequency, Some("RW_HZ"), Some(30.0), 151, "RULE_B"),
        ])
        .await;

    assert_eq!(state.word(1, RegisterType::Holding, 16), Some(60));
    // Exactly one write happened.
    let writes = state
        .count_events(|e| matches!(e, crate::test_support::LinkEvent::WriteReg { addr: 16, .. }));
    assert_eq!(writes, 1);
}

#[tokio::test(start_paused = true)]
async fn equal_priority_overwrites_in_declaration_order() {
    let (device, state) = vfd_device(1);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[
            action(1, ActionType::SetFrequency, Some("RW_HZ"), Some(60.0), 95, "FIRST"),
            action(1, ActionType::SetFrequency, Some("RW_HZ"), Some(30.0), 95, "SECOND"),
        ])
        .await;

    // Same priority: the later declaration overwrites.
    assert_eq!(state.word(1, RegisterType::Holding, 16), Some(30));
}

#[tokio::test(start_paused = true)]
async fn different_targets_do_not_arbitrate() {
    let (device, state) = vfd_device(1);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[
            action(1, ActionType::SetFrequency, Some("RW_HZ"), Some(60.0), 95, "A"),
            action(1, ActionType::WriteDo, Some("RW_ON_OFF"), Some(1.0), 151, "B"),
        ])
        .await;

    assert_eq!(state.word(1, RegisterType::Holding, 16), Some(60));
    assert_eq!(state.word(1, RegisterType::Holding, 0), Some(1));
}

#[tokio::test(start_paused = true)]
async fn unhealthy_device_is_skipped() {
    let (device, state) = vfd_device(1);
    let health = Arc::new(HealthManager::new(HealthConfig::default()));
    health.mark_failure("TECO_VFD_1");
    let executor =
        ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), Some(health));

    executor
        .execute(&[action(1, ActionType::SetFrequency, Some("RW_HZ"), Some(50.0), 90, "SET")])
        .await;

    assert_eq!(
        state.count_events(|e| matches!(e, crate::test_support::LinkEvent::WriteReg { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_register_and_readonly_register_are_skipped() {
    let (device, state) = vfd_device(1);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[
            action(1, ActionType::SetFrequency, Some("NO_SUCH"), Some(50.0), 90, "A"),
            action(1, ActionType::SetFrequency, Some("RO_STATUS"), Some(50.0), 90, "B"),
        ])
        .await;

    assert_eq!(
        state.count_events(|e| matches!(e, crate::test_support::LinkEvent::WriteReg { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn redundant_write_is_skipped() {
    let (device, state) = vfd_device(1);
    state.set_word(1, RegisterType::Holding, 16, 50);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[action(1, ActionType::SetFrequency, Some("RW_HZ"), Some(50.0), 90, "SET")])
        .await;

    assert_eq!(
        state.count_events(|e| matches!(e, crate::test_support::LinkEvent::WriteReg { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn adjust_frequency_reads_then_writes_sum() {
    let (device, state) = vfd_device(1);
    state.set_word(1, RegisterType::Holding, 16, 45);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[action(1, ActionType::AdjustFrequency, Some("RW_HZ"), Some(3.0), 90, "ADJ")])
        .await;

    assert_eq!(state.word(1, RegisterType::Holding, 16), Some(48));
}

#[tokio::test(start_paused = true)]
async fn adjust_with_unreadable_current_skips() {
    let (device, state) = vfd_device(1);
    state.push_outcome(crate::test_support::Outcome::Timeout);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[action(1, ActionType::AdjustFrequency, Some("RW_HZ"), Some(3.0), 90, "ADJ")])
        .await;

    assert_eq!(
        state.count_events(|e| matches!(e, crate::test_support::LinkEvent::WriteReg { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn zero_adjustment_is_skipped() {
    let (device, state) = vfd_device(1);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[action(1, ActionType::AdjustFrequency, Some("RW_HZ"), Some(0.0), 90, "ADJ")])
        .await;

    assert_eq!(
        state.count_events(|e| matches!(e, crate::test_support::LinkEvent::WriteReg { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn turn_on_skips_when_already_on() {
    let (device, state) = vfd_device(1);
    state.set_word(1, RegisterType::Holding, 0, 1);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor.execute(&[action(1, ActionType::TurnOn, None, None, 90, "ON")]).await;

    assert_eq!(
        state.count_events(|e| matches!(e, crate::test_support::LinkEvent::WriteReg { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn turn_off_writes_when_running() {
    let (device, state) = vfd_device(1);
    state.set_word(1, RegisterType::Holding, 0, 1);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor.execute(&[action(1, ActionType::TurnOff, None, None, 90, "OFF")]).await;

    assert_eq!(state.word(1, RegisterType::Holding, 0), Some(0));
}

#[tokio::test(start_paused = true)]
async fn missing_device_does_not_abort_list() {
    let (device, state) = vfd_device(1);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[
            action(9, ActionType::SetFrequency, Some("RW_HZ"), Some(50.0), 90, "GHOST"),
            action(1, ActionType::SetFrequency, Some("RW_HZ"), Some(40.0), 95, "REAL"),
        ])
        .await;

    assert_eq!(state.word(1, RegisterType::Holding, 16), Some(40));
}

#[tokio::test(start_paused = true)]
async fn protection_applies_across_action_types() {
    // A higher-priority set_frequency protects the target from a later
    // lower-priority adjust on the same register.
    let (device, state) = vfd_device(1);
    state.set_word(1, RegisterType::Holding, 16, 45);
    let executor = ControlExecutor::new(Arc::new(DeviceManager::from_devices(vec![device])), None);

    executor
        .execute(&[
            action(1, ActionType::SetFrequency, Some("RW_HZ"), Some(50.0), 10, "SET"),
            action(1, ActionType::AdjustFrequency, Some("RW_HZ"), Some(5.0), 99, "ADJ"),
        ])
        .await;

    assert_eq!(state.word(1, RegisterType::Holding, 16), Some(50));
}
