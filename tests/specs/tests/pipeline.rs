// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end pipeline tests: monitor through pub/sub into the alert,
//! control, storage, and uplink subsystems, over fake serial links.

use std::collections::HashMap;
use std::sync::Arc;

use fieldgate::alert::{AlertConfig, AlertEvaluator};
use fieldgate::composite_eval::CompositeEvaluator;
use fieldgate::control::{ConstraintConfig, ControlConfig, ControlEvaluator};
use fieldgate::event::AlertEdge;
use fieldgate::executor::ControlExecutor;
use fieldgate::outbox::OutboxStore;
use fieldgate::pubsub::Topic;
use fieldgate::registers::RegisterType;
use fieldgate::resend::ResendWorker;
use fieldgate::sender::{ResendTransport, Sender, SenderConfig, UplinkShared};
use fieldgate::snapshot::Snapshot;
use fieldgate::store::SnapshotStore;
use fieldgate_specs::{pin, writable_pin, DeviceDef, Rig, RigBuilder};

fn meter_rig() -> Rig {
    RigBuilder::new()
        .single_port()
        .device(
            DeviceDef::new("ADTEK_CPM10", 1, "power_meter")
                .with_pin("Kw", pin(10))
                .with_pin("Kva", pin(11)),
        )
        .device(
            DeviceDef::new("ADTEK_CPM10", 2, "power_meter")
                .with_pin("Kw", pin(10))
                .with_pin("Kva", pin(11)),
        )
        .build()
}

async fn drain_snapshots(
    rig: &Rig,
    subscription: &mut fieldgate::pubsub::Subscription<fieldgate::event::Event>,
) -> HashMap<String, Arc<Snapshot>> {
    rig.monitor.tick().await;
    let mut snapshots = HashMap::new();
    while let Some(event) = subscription.try_recv() {
        if let Some(snap) = event.as_snapshot() {
            snapshots.insert(snap.device_id.clone(), Arc::clone(snap));
        }
    }
    snapshots
}

#[tokio::test(start_paused = true)]
async fn monitor_to_virtual_aggregation() {
    let rig = RigBuilder::new()
        .single_port()
        .device(
            DeviceDef::new("ADTEK_CPM10", 1, "power_meter")
                .with_pin("Kw", pin(10))
                .with_pin("Kva", pin(11)),
        )
        .device(
            DeviceDef::new("ADTEK_CPM10", 2, "power_meter")
                .with_pin("Kw", pin(10))
                .with_pin("Kva", pin(11)),
        )
        .virtual_devices(
            r#"{"virtual_devices": [{
                "id": "total",
                "type": "aggregated_power_meter",
                "source": {"model": "ADTEK_CPM10"},
                "target": {"model": "ADTEK_CPM10", "slave_id": "auto"},
                "aggregation": {"fields": [
                    {"name": "Kw", "method": "sum"},
                    {"name": "Kva", "method": "sum"},
                    {"name": "AveragePowerFactor", "method": "calculated_pf"}
                ]}
            }]}"#,
        )
        .build();
    let link = &rig.links[0];
    link.set_word(1, RegisterType::Holding, 10, 100);
    link.set_word(1, RegisterType::Holding, 11, 120);
    link.set_word(2, RegisterType::Holding, 10, 150);
    link.set_word(2, RegisterType::Holding, 11, 180);

    let mut subscription = rig.pubsub.subscribe(Topic::DeviceSnapshot);
    let snapshots = drain_snapshots(&rig, &mut subscription).await;

    assert_eq!(snapshots.len(), 3);
    let total = snapshots.get("ADTEK_CPM10_3").expect("virtual snapshot");
    assert!(total.is_virtual);
    assert_eq!(total.values.get("Kw"), Some(&250.0));
    assert_eq!(total.values.get("Kva"), Some(&300.0));
    let pf = total.values.get("AveragePowerFactor").copied().expect("pf");
    assert!((pf - 0.8333).abs() < 0.001);
}

#[tokio::test(start_paused = true)]
async fn monitor_to_alert_edges() {
    let rig = RigBuilder::new()
        .device(DeviceDef::new("TECO_VFD", 2, "inverter").with_pin("AIn01", pin(0)))
        .build();
    let link = &rig.links[0];

    let alert_config: AlertConfig = serde_json::from_str(
        r#"{"TECO_VFD": {"instances": {"2": [{
            "code": "HIGH_TEMP", "name": "High temperature", "severity": "warning",
            "type": "threshold", "sources": ["AIn01"], "operator": "gt", "threshold": 40.0
        }]}}}"#,
    )
    .expect("alert config");
    let evaluator = AlertEvaluator::new(alert_config, &rig.devices.device_ids(), None);

    let mut subscription = rig.pubsub.subscribe(Topic::DeviceSnapshot);

    // Tick 1: hot -> TRIGGERED.
    link.set_word(2, RegisterType::Holding, 0, 42);
    let snapshots = drain_snapshots(&rig, &mut subscription).await;
    let notices = evaluator.evaluate(snapshots.get("TECO_VFD_2").expect("snapshot"));
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].edge, AlertEdge::Triggered);

    // Tick 2: still hot -> suppressed.
    let snapshots = drain_snapshots(&rig, &mut subscription).await;
    assert!(evaluator.evaluate(snapshots.get("TECO_VFD_2").expect("snapshot")).is_empty());

    // Tick 3: cooled -> RESOLVED.
    link.set_word(2, RegisterType::Holding, 0, 30);
    let snapshots = drain_snapshots(&rig, &mut subscription).await;
    let notices = evaluator.evaluate(snapshots.get("TECO_VFD_2").expect("snapshot"));
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].edge, AlertEdge::Resolved);
}

#[tokio::test(start_paused = true)]
async fn monitor_to_control_write_round_trip() {
    let rig = RigBuilder::new()
        .device(
            DeviceDef::new("TECO_VFD", 2, "inverter")
                .with_pin("AIn01", pin(0))
                .with_pin("RW_HZ", writable_pin(16)),
        )
        .build();
    let link = &rig.links[0];
    link.set_word(2, RegisterType::Holding, 0, 29);

    let control_config: ControlConfig = serde_json::from_str(
        r#"{"TECO_VFD": {"instances": {"2": [{
            "code": "ABS_TEMP01", "name": "Linear control", "priority": 90,
            "composite": {"type": "threshold", "sources": ["AIn01"], "operator": "gt", "threshold": 25.0},
            "policy": {"type": "absolute_linear", "condition_type": "threshold", "sources": ["AIn01"],
                       "base_freq": 40.0, "base_temp": 25.0, "gain_hz_per_unit": 1.0},
            "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ"}]
        }]}}}"#,
    )
    .expect("control config");
    let evaluator = ControlEvaluator::new(
        control_config,
        ConstraintConfig::new(),
        CompositeEvaluator::new(None, None),
    );
    let executor = ControlExecutor::new(Arc::clone(&rig.devices), Some(Arc::clone(&rig.health)));

    let mut subscription = rig.pubsub.subscribe(Topic::DeviceSnapshot);
    let snapshots = drain_snapshots(&rig, &mut subscription).await;
    let snapshot = snapshots.get("TECO_VFD_2").expect("snapshot");

    let actions = evaluator.evaluate(&snapshot.model, snapshot.slave_id, &snapshot.values);
    assert_eq!(actions.len(), 1);
    executor.execute(&actions).await;

    // 40 + (29 - 25) * 1.0 = 44
    assert_eq!(link.word(2, RegisterType::Holding, 16), Some(44));
}

#[tokio::test(start_paused = true)]
async fn monitor_to_store_round_trip() {
    let rig = RigBuilder::new()
        .device(DeviceDef::new("ADTEK_CPM10", 1, "power_meter").with_pin("Kw", pin(10)))
        .build();
    rig.links[0].set_word(1, RegisterType::Holding, 10, 77);

    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::open(dir.path().join("snapshots.db")).expect("store");

    let mut subscription = rig.pubsub.subscribe(Topic::DeviceSnapshot);
    let snapshots = drain_snapshots(&rig, &mut subscription).await;
    for snapshot in snapshots.values() {
        store.insert(snapshot).await.expect("insert");
    }

    let rows = store.get_latest_by_device("ADTEK_CPM10_1", 10).await.expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values.get("Kw"), Some(&77.0));
}

fn sender_fixture(dir: &std::path::Path, transport: Arc<fieldgate::test_support::MockTransport>) -> (Arc<Sender>, Arc<OutboxStore>, Arc<UplinkShared>, SenderConfig) {
    let config: SenderConfig = serde_json::from_value(serde_json::json!({
        "gateway_id": "GW123456789",
        "ima_url": "http://cloud.example/push",
        "send_interval_sec": 60,
        "attempt_count": 1,
        "max_retry": 3,
        "outbox": {"dir": dir.join("outbox")}
    }))
    .expect("sender config");
    let store = Arc::new(OutboxStore::new(config.outbox.clone()).expect("outbox"));
    let shared = Arc::new(UplinkShared::default());
    let sender = Arc::new(Sender::new(
        config.clone(),
        Arc::clone(&store),
        transport,
        Arc::clone(&shared),
        dir,
    ));
    (sender, store, shared, config)
}

#[tokio::test(start_paused = true)]
async fn monitor_to_sender_payload() {
    let rig = RigBuilder::new()
        .device(DeviceDef::new("ADTEK_CPM10", 1, "power_meter").with_pin("Kw", pin(10)))
        .build();
    rig.links[0].set_word(1, RegisterType::Holding, 10, 88);

    let dir = tempfile::tempdir().expect("tempdir");
    let (sender, store, _, _) = sender_fixture(dir.path(), rig.transport.clone());

    let mut subscription = rig.pubsub.subscribe(Topic::DeviceSnapshot);
    let snapshots = drain_snapshots(&rig, &mut subscription).await;
    for snapshot in snapshots.values() {
        sender.handle_snapshot(Arc::clone(snapshot));
    }

    sender.send_at_label(chrono::Local::now(), None).await;

    assert_eq!(rig.transport.sent_count(), 1);
    let sent = rig.transport.sent.lock();
    let payload = &sent[0];
    assert_eq!(payload.get("FUNC"), Some(&serde_json::json!("PushIMAData")));
    let data = payload.get("Data").and_then(|d| d.as_array()).expect("data");
    // Device item + heartbeat.
    assert_eq!(data.len(), 2);
    // Success: outbox is clean.
    assert_eq!(store.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_send_is_replayed_by_resend_worker() {
    let rig = RigBuilder::new()
        .device(DeviceDef::new("ADTEK_CPM10", 1, "power_meter").with_pin("Kw", pin(10)))
        .build();
    rig.links[0].set_word(1, RegisterType::Holding, 10, 88);

    let dir = tempfile::tempdir().expect("tempdir");
    let (sender, store, shared, config) = sender_fixture(dir.path(), rig.transport.clone());

    let mut subscription = rig.pubsub.subscribe(Topic::DeviceSnapshot);
    let snapshots = drain_snapshots(&rig, &mut subscription).await;
    for snapshot in snapshots.values() {
        sender.handle_snapshot(Arc::clone(snapshot));
    }

    // First POST fails: the payload stays in the outbox.
    rig.transport.push_result(false);
    sender.send_at_label(chrono::Local::now(), None).await;
    assert_eq!(store.pending_count(), 1);

    // The resend worker replays it and cleans up.
    let worker = ResendWorker::new(
        config,
        sender.gateway_id(),
        Arc::clone(&store),
        rig.transport.clone() as Arc<dyn ResendTransport>,
        shared,
    );
    let (processed, succeeded) = worker.process_batch(10).await;
    assert_eq!((processed, succeeded), (1, 1));
    assert_eq!(store.pending_count(), 0);
    assert_eq!(rig.transport.sent_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn shared_port_serializes_requests_across_devices() {
    let rig = meter_rig();
    let link = &rig.links[0];

    rig.monitor.tick().await;

    // Every request on the shared port is preceded by an RX flush; two
    // requests never run back to back without one.
    let events = link.events();
    let mut last_was_request = false;
    for event in &events {
        match event {
            fieldgate::test_support::LinkEvent::ReadRegs { .. } => {
                assert!(!last_was_request, "unflushed back-to-back requests: {events:?}");
                last_was_request = true;
            }
            fieldgate::test_support::LinkEvent::ClearRx => last_was_request = false,
            _ => {}
        }
    }
}
