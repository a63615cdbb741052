// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn physical(model: &str, slave_id: u8, pairs: &[(&str, f64)]) -> Arc<Snapshot> {
    let mut snap = Snapshot::new(model, slave_id, "power_meter");
    for (name, value) in pairs {
        snap.values.insert((*name).to_owned(), *value);
    }
    snap.is_online = true;
    Arc::new(snap)
}

fn raw_map(snaps: Vec<Arc<Snapshot>>) -> HashMap<String, Arc<Snapshot>> {
    snaps.into_iter().map(|s| (s.device_id.clone(), s)).collect()
}

fn aggregated_spec(json: &str) -> VirtualDevicesConfig {
    serde_json::from_str(json).expect("virtual device config")
}

fn meter_config() -> VirtualDevicesConfig {
    aggregated_spec(
        r#"{"virtual_devices": [{
            "id": "total_power",
            "type": "aggregated_power_meter",
            "source": {"model": "ADTEK_CPM10"},
            "target": {"model": "ADTEK_CPM10", "slave_id": "auto"},
            "aggregation": {
                "error_handling": "fail_fast",
                "fields": [
                    {"name": "Kw", "method": "sum"},
                    {"name": "Kva", "method": "sum"},
                    {"name": "AveragePowerFactor", "method": "calculated_pf"}
                ]
            }
        }]}"#,
    )
}

#[test]
fn aggregates_two_meters_with_power_factor() {
    // Scenario: Kw 100+150, Kva 120+180 -> virtual device slave 3 with
    // Kw=250, Kva=300, PF ~= 0.833.
    let manager = VirtualDeviceManager::new(meter_config(), 2);
    let raw = raw_map(vec![
        physical("ADTEK_CPM10", 1, &[("Kw", 100.0), ("Kva", 120.0)]),
        physical("ADTEK_CPM10", 2, &[("Kw", 150.0), ("Kva", 180.0)]),
    ]);

    let snapshots = manager.compute_virtual_snapshots(&raw);
    assert_eq!(snapshots.len(), 1);
    let snap = &snapshots[0];
    assert_eq!(snap.device_id, "ADTEK_CPM10_3");
    assert_eq!(snap.slave_id, 3);
    assert!(snap.is_virtual);
    assert_eq!(snap.values.get("Kw"), Some(&250.0));
    assert_eq!(snap.values.get("Kva"), Some(&300.0));
    let pf = snap.values.get("AveragePowerFactor").copied().expect("pf");
    assert!((pf - 0.8333).abs() < 0.001);
    assert_eq!(
        snap.source_device_ids,
        vec!["ADTEK_CPM10_1".to_owned(), "ADTEK_CPM10_2".to_owned()]
    );
}

#[test]
fn fail_fast_poisons_field_on_any_missing_source() {
    let manager = VirtualDeviceManager::new(meter_config(), 2);
    let raw = raw_map(vec![
        physical("ADTEK_CPM10", 1, &[("Kw", 100.0), ("Kva", 120.0)]),
        physical("ADTEK_CPM10", 2, &[("Kw", crate::snapshot::MISSING), ("Kva", 180.0)]),
    ]);

    let snapshots = manager.compute_virtual_snapshots(&raw);
    let snap = &snapshots[0];
    assert_eq!(snap.values.get("Kw"), Some(&crate::snapshot::MISSING));
    // Kva still aggregates; PF fails because Kw is missing.
    assert_eq!(snap.values.get("Kva"), Some(&300.0));
    assert_eq!(snap.values.get("AveragePowerFactor"), Some(&crate::snapshot::MISSING));
}

#[test]
fn partial_mode_uses_available_values() {
    let config = aggregated_spec(
        r#"{"virtual_devices": [{
            "id": "partial_power",
            "type": "aggregated_power_meter",
            "source": {"model": "ADTEK_CPM10"},
            "target": {"model": "ADTEK_CPM10", "slave_id": 9},
            "aggregation": {
                "error_handling": "partial",
                "fields": [{"name": "Kw", "method": "avg"}]
            }
        }]}"#,
    );
    let manager = VirtualDeviceManager::new(config, 2);
    let raw = raw_map(vec![
        physical("ADTEK_CPM10", 1, &[("Kw", 100.0)]),
        physical("ADTEK_CPM10", 2, &[("Kw", crate::snapshot::MISSING)]),
    ]);

    let snapshots = manager.compute_virtual_snapshots(&raw);
    assert_eq!(snapshots[0].values.get("Kw"), Some(&100.0));
    assert_eq!(snapshots[0].slave_id, 9);
}

#[test]
fn slave_id_filter_limits_sources() {
    let config = aggregated_spec(
        r#"{"virtual_devices": [{
            "id": "line_a",
            "type": "aggregated_power_meter",
            "source": {"model": "ADTEK_CPM10", "slave_ids": [1]},
            "target": {"model": "ADTEK_CPM10", "slave_id": 9},
            "aggregation": {"fields": [{"name": "Kw", "method": "sum"}]}
        }]}"#,
    );
    let manager = VirtualDeviceManager::new(config, 2);
    let raw = raw_map(vec![
        physical("ADTEK_CPM10", 1, &[("Kw", 100.0)]),
        physical("ADTEK_CPM10", 2, &[("Kw", 150.0)]),
    ]);

    let snapshots = manager.compute_virtual_snapshots(&raw);
    assert_eq!(snapshots[0].values.get("Kw"), Some(&100.0));
    assert_eq!(snapshots[0].source_device_ids, vec!["ADTEK_CPM10_1".to_owned()]);
}

#[test]
fn virtual_sources_are_never_aggregated() {
    let manager = VirtualDeviceManager::new(meter_config(), 2);
    let mut loopback = Snapshot::new("ADTEK_CPM10", 3, "power_meter");
    loopback.is_virtual = true;
    loopback.values.insert("Kw".into(), 999.0);
    let raw = raw_map(vec![
        physical("ADTEK_CPM10", 1, &[("Kw", 100.0), ("Kva", 120.0)]),
        Arc::new(loopback),
    ]);

    let snapshots = manager.compute_virtual_snapshots(&raw);
    assert_eq!(snapshots[0].values.get("Kw"), Some(&100.0));
}

#[test]
fn no_matching_sources_emits_nothing() {
    let manager = VirtualDeviceManager::new(meter_config(), 2);
    let raw = raw_map(vec![physical("OTHER_METER", 1, &[("Kw", 100.0)])]);
    assert!(manager.compute_virtual_snapshots(&raw).is_empty());
}

#[test]
fn sampling_ts_is_max_of_sources() {
    let manager = VirtualDeviceManager::new(meter_config(), 2);
    let early = physical("ADTEK_CPM10", 1, &[("Kw", 100.0), ("Kva", 120.0)]);
    let mut late_snap = Snapshot::new("ADTEK_CPM10", 2, "power_meter");
    late_snap.values.insert("Kw".into(), 150.0);
    late_snap.values.insert("Kva".into(), 180.0);
    late_snap.sampling_ts = early.sampling_ts + chrono::TimeDelta::seconds(30);
    let late_ts = late_snap.sampling_ts;
    let raw = raw_map(vec![early, Arc::new(late_snap)]);

    let snapshots = manager.compute_virtual_snapshots(&raw);
    assert_eq!(snapshots[0].sampling_ts, late_ts);
}

#[test]
fn pf_zero_kva_returns_zero() {
    let manager = VirtualDeviceManager::new(meter_config(), 2);
    let raw = raw_map(vec![physical("ADTEK_CPM10", 1, &[("Kw", 0.0), ("Kva", 0.0)])]);
    let snapshots = manager.compute_virtual_snapshots(&raw);
    assert_eq!(snapshots[0].values.get("AveragePowerFactor"), Some(&0.0));
}

#[test]
fn pf_clamped_to_unit_range() {
    let manager = VirtualDeviceManager::new(meter_config(), 2);
    let raw = raw_map(vec![physical("ADTEK_CPM10", 1, &[("Kw", 200.0), ("Kva", 100.0)])]);
    let snapshots = manager.compute_virtual_snapshots(&raw);
    assert_eq!(snapshots[0].values.get("AveragePowerFactor"), Some(&1.0));
}

#[test]
fn disabled_specs_are_ignored() {
    let config = aggregated_spec(
        r#"{"virtual_devices": [{
            "id": "off",
            "enabled": false,
            "type": "aggregated_power_meter",
            "source": {"model": "ADTEK_CPM10"},
            "target": {"model": "ADTEK_CPM10", "slave_id": 9},
            "aggregation": {"fields": [{"name": "Kw", "method": "sum"}]}
        }]}"#,
    );
    let manager = VirtualDeviceManager::new(config, 2);
    assert!(manager.is_empty());
}
