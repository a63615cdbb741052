// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use chrono::TimeDelta;
use yare::parameterized;

fn snap(device: &str, offset_min: i64) -> Snapshot {
    let (model, slave) = crate::snapshot::split_device_id(device).expect("device id");
    let mut snapshot = Snapshot::new(model, slave, "power_meter");
    snapshot.sampling_ts = Local::now() - TimeDelta::minutes(offset_min);
    snapshot.values.insert("Kw".into(), 100.0 + offset_min as f64);
    snapshot.is_online = true;
    snapshot
}

async fn store_with(rows: Vec<Snapshot>) -> (SnapshotStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::open(dir.path().join("snapshots.db")).expect("open");
    for row in rows {
        store.insert(&row).await.expect("insert");
    }
    (store, dir)
}

#[tokio::test]
async fn insert_and_read_back() {
    let (store, _dir) = store_with(vec![snap("METER_1", 5)]).await;

    let start = Local::now() - TimeDelta::hours(1);
    let end = Local::now();
    let rows = store.get_time_range("METER_1", start, end, 10, 0).await.expect("query");

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].device_id, "METER_1");
    assert_eq!(rows[0].values.get("Kw"), Some(&105.0));
    assert!(rows[0].is_online);
}

#[tokio::test]
async fn time_range_is_ordered_and_paginated() {
    let rows: Vec<Snapshot> = (0..5).map(|i| snap("METER_1", 50 - i * 10)).collect();
    let (store, _dir) = store_with(rows).await;

    let start = Local::now() - TimeDelta::hours(2);
    let end = Local::now();

    let page1 = store.get_time_range("METER_1", start, end, 2, 0).await.expect("page1");
    assert_eq!(page1.len(), 2);
    assert!(page1[0].sampling_ts < page1[1].sampling_ts);

    let page2 = store.get_time_range("METER_1", start, end, 2, 2).await.expect("page2");
    assert_eq!(page2.len(), 2);
    assert!(page1[1].sampling_ts < page2[0].sampling_ts);

    let total = store.count_in_time_range("METER_1", start, end).await.expect("count");
    assert_eq!(total, 5);
}

#[tokio::test]
async fn invalid_range_is_rejected() {
    let (store, _dir) = store_with(vec![]).await;
    let start = Local::now();
    let end = start - TimeDelta::hours(1);
    assert!(store.get_time_range("METER_1", start, end, 10, 0).await.is_err());
    assert!(store.count_in_time_range("METER_1", start, end).await.is_err());
}

#[tokio::test]
async fn range_filters_by_device() {
    let (store, _dir) = store_with(vec![snap("METER_1", 5), snap("OTHER_2", 5)]).await;
    let start = Local::now() - TimeDelta::hours(1);
    let rows = store.get_time_range("METER_1", start, Local::now(), 10, 0).await.expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].device_id, "METER_1");
}

#[tokio::test]
async fn latest_by_device_is_newest_first() {
    let (store, _dir) =
        store_with(vec![snap("METER_1", 30), snap("METER_1", 10), snap("METER_1", 20)]).await;

    let rows = store.get_latest_by_device("METER_1", 2).await.expect("rows");
    assert_eq!(rows.len(), 2);
    assert!(rows[0].sampling_ts > rows[1].sampling_ts);
}

#[tokio::test]
async fn recent_window_filters_by_age() {
    let (store, _dir) = store_with(vec![snap("METER_1", 5), snap("METER_1", 120)]).await;
    let rows = store.get_all_recent(30).await.expect("rows");
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn db_stats_reflect_contents() {
    let (store, _dir) = store_with(vec![snap("METER_1", 20), snap("METER_1", 10)]).await;
    let stats = store.get_db_stats().await.expect("stats");
    assert_eq!(stats.total_count, 2);
    let earliest = stats.earliest_ts.expect("earliest");
    let latest = stats.latest_ts.expect("latest");
    assert!(earliest < latest);
    assert!(stats.file_size_bytes > 0);
}

#[tokio::test]
async fn cleanup_removes_only_expired_rows() {
    let old = {
        let mut s = snap("METER_1", 0);
        s.sampling_ts = Local::now() - TimeDelta::days(30);
        s
    };
    let (store, _dir) = store_with(vec![old, snap("METER_1", 5)]).await;

    let deleted = store.cleanup_old_snapshots(14).await.expect("cleanup");
    assert_eq!(deleted, 1);
    let stats = store.get_db_stats().await.expect("stats");
    assert_eq!(stats.total_count, 1);
}

#[tokio::test]
async fn vacuum_succeeds() {
    let (store, _dir) = store_with(vec![snap("METER_1", 5)]).await;
    store.cleanup_old_snapshots(0).await.expect("cleanup");
    store.vacuum_database().await.expect("vacuum");
}

#[tokio::test]
async fn virtual_flag_round_trips() {
    let mut virtual_snap = snap("ADTEK_CPM10_3", 1);
    virtual_snap.is_virtual = true;
    let (store, _dir) = store_with(vec![virtual_snap]).await;
    let rows = store.get_latest_by_device("ADTEK_CPM10_3", 1).await.expect("rows");
    assert!(rows[0].is_virtual);
}

#[parameterized(
    empty = { 0, 10, 0, 1, 0, false, false },
    first_of_three = { 25, 10, 0, 1, 3, true, false },
    middle = { 25, 10, 10, 2, 3, true, true },
    last_partial = { 25, 10, 20, 3, 3, false, true },
)]
#[allow(arithmetic_overflow)]
fn page_info_math(
    total: u64,
    limit: u64,
    offset: u64,
    page_number: u64,
    total_pages: u64,
    has_next: bool,
    has_previous: bool,
) {
    let info = PageInfo::new(total, limit, offset);
    assert_eq!(info.page_number, page_number);
    assert_eq!(info.total_pages, total_pages);
    assert_eq!(info.has_next, has_next);
    assert_eq!(info.has_previous, has_previous);
    if has_next {
        assert_eq!(info.next_offset, Some(offset + limit));
    } else {
        assert_eq!(info.next_offset, None);
    }
    if has_previous {
        assert_eq!(info.previous_offset, Some(offset - limit));
    } else {
        assert_eq!(info.previous_offset, None);
    }
}
