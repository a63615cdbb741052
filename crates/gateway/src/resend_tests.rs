// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_support::MockTransport;
use chrono::TimeZone;

struct Fixture {
    worker: Arc<ResendWorker>,
    transport: Arc<MockTransport>,
    store: Arc<OutboxStore>,
    shared: Arc<UplinkShared>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let config: SenderConfig = serde_json::from_value(serde_json::json!({
        "gateway_id": "GW123456789",
        "ima_url": "http://cloud.example/push",
        "max_retry": 2,
        "last_post_ok_within_sec": 600.0,
        "outbox": {"dir": dir.path().join("outbox")}
    }))
    .expect("config");
    let store = Arc::new(OutboxStore::new(config.outbox.clone()).expect("store"));
    let transport = MockTransport::new();
    let shared = Arc::new(UplinkShared::default());
    let worker = Arc::new(ResendWorker::new(
        config,
        "GW123456789",
        Arc::clone(&store),
        transport.clone() as Arc<dyn ResendTransport>,
        Arc::clone(&shared),
    ));
    Fixture { worker, transport, store, shared, _dir: dir }
}

fn label(hour: u32, minute: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2026, 3, 14, hour, minute, 0).single().expect("ts")
}

fn full_packet() -> Value {
    serde_json::json!({
        "FUNC": "PushIMAData",
        "version": "6.0",
        "GatewayID": "GW123456789",
        "Timestamp": "20260314120000",
        "Data": []
    })
}

fn item(device: &str, report_ts: &str) -> Value {
    serde_json::json!({
        "DeviceID": device,
        "Data": {"Kw": 1.0, "report_ts": report_ts}
    })
}

#[tokio::test]
async fn successful_packet_resend_deletes_file() {
    let f = fixture();
    let path = f.store.persist_payload(&full_packet(), label(12, 0)).expect("persist");

    let (processed, succeeded) = f.worker.process_batch(10).await;

    assert_eq!((processed, succeeded), (1, 1));
    assert!(!path.exists());
    assert_eq!(f.transport.sent_count(), 1);
    assert!(f.shared.last_post_ok.lock().is_some());
}

#[tokio::test]
async fn failed_resend_escalates_retry_counter() {
    let f = fixture();
    let path = f.store.persist_payload(&full_packet(), label(12, 0)).expect("persist");
    f.transport.push_result(false);

    let (processed, succeeded) = f.worker.process_batch(10).await;
    assert_eq!((processed, succeeded), (1, 0));
    assert!(!path.exists());
    // One pending file remains, renamed with a retry counter.
    assert_eq!(f.store.pending_count(), 1);
    let batch = f.store.pick_batch(10, 0.0);
    let name = batch[0].file_name().and_then(|n| n.to_str()).expect("name");
    assert!(name.contains(".retry1."), "{name}");
}

#[tokio::test]
async fn exceeding_max_retry_marks_fail() {
    let f = fixture();
    f.store.persist_payload(&full_packet(), label(12, 0)).expect("persist");

    // max_retry = 2: first failure -> retry1, second failure -> .fail.
    f.transport.push_result(false);
    f.worker.process_batch(10).await;
    f.transport.push_result(false);
    f.worker.process_batch(10).await;

    assert_eq!(f.store.pending_count(), 0);
    let fail_files: Vec<_> = std::fs::read_dir(f.store.dir())
        .expect("read dir")
        .flatten()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("fail"))
        .collect();
    assert_eq!(fail_files.len(), 1);
}

#[tokio::test]
async fn item_files_group_by_label_timestamp() {
    let f = fixture();
    // Two items with the same report_ts, one with a different one.
    let ts_a = "2026-03-14T12:00:00+08:00";
    let ts_b = "2026-03-14T12:05:00+08:00";
    f.store.persist_payload(&item("GW123456789_101PM", ts_a), label(12, 0)).expect("a1");
    f.store.persist_payload(&item("GW123456789_102PM", ts_a), label(12, 0)).expect("a2");
    f.store.persist_payload(&item("GW123456789_103PM", ts_b), label(12, 5)).expect("b");

    let (processed, succeeded) = f.worker.process_batch(10).await;
    assert_eq!((processed, succeeded), (3, 3));

    // One payload per group: two sends total.
    assert_eq!(f.transport.sent_count(), 2);
    let sent = f.transport.sent.lock();
    let sizes: Vec<usize> = sent
        .iter()
        .map(|p| p.get("Data").and_then(|d| d.as_array()).map(Vec::len).unwrap_or(0))
        .collect();
    assert!(sizes.contains(&2) && sizes.contains(&1), "{sizes:?}");
    // Groups are wrapped in full envelopes.
    assert!(sent.iter().all(|p| p.get("FUNC").is_some()));
}

#[tokio::test]
async fn unparseable_file_goes_to_retry_path() {
    let f = fixture();
    let path = f.store.dir().join("resend_20260314120000_0.json");
    std::fs::write(&path, b"not json at all").expect("write");

    let (processed, succeeded) = f.worker.process_batch(10).await;
    assert_eq!((processed, succeeded), (1, 0));
    assert_eq!(f.transport.sent_count(), 0);
    let batch = f.store.pick_batch(10, 0.0);
    assert!(batch[0]
        .file_name()
        .and_then(|n| n.to_str())
        .expect("name")
        .contains(".retry1."));
}

#[tokio::test]
async fn empty_outbox_is_a_noop() {
    let f = fixture();
    let (processed, succeeded) = f.worker.process_batch(10).await;
    assert_eq!((processed, succeeded), (0, 0));
}

#[tokio::test]
async fn batch_limit_is_respected() {
    let f = fixture();
    for i in 0..5 {
        f.store.persist_payload(&full_packet(), label(12, i)).expect("persist");
    }
    let (processed, _) = f.worker.process_batch(2).await;
    assert_eq!(processed, 2);
    assert_eq!(f.store.pending_count(), 3);
}

#[test]
fn health_gate_requires_recent_success() {
    let f = fixture();
    // No success yet: unhealthy.
    assert!(!f.worker.cloud_looks_healthy());

    f.shared.record_post_ok(Local::now());
    assert!(f.worker.cloud_looks_healthy());

    // Stale success: unhealthy again.
    *f.shared.last_post_ok.lock() = Some(Local::now() - chrono::TimeDelta::seconds(4000));
    assert!(!f.worker.cloud_looks_healthy());
}

#[test]
fn health_gate_disabled_when_window_is_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config: SenderConfig = serde_json::from_value(serde_json::json!({
        "gateway_id": "GW123456789",
        "ima_url": "http://cloud.example/push",
        "last_post_ok_within_sec": 0.0,
        "outbox": {"dir": dir.path().join("outbox")}
    }))
    .expect("config");
    let store = Arc::new(OutboxStore::new(config.outbox.clone()).expect("store"));
    let worker = ResendWorker::new(
        config,
        "GW123456789",
        store,
        MockTransport::new(),
        Arc::new(UplinkShared::default()),
    );
    assert!(worker.cloud_looks_healthy());
}
