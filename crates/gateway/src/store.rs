// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only, time-indexed snapshot persistence on SQLite.
//!
//! All statements run on the blocking pool; the connection lives behind one
//! mutex. Reads are ordered by sampling time and paginated; cleanup deletes
//! by retention age and a longer-interval vacuum reclaims the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotStorageConfig {
    #[serde(default)]
    pub enabled: bool,
    pub db_path: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: f64,
    #[serde(default = "default_vacuum_interval_days")]
    pub vacuum_interval_days: f64,
}

fn default_retention_days() -> u32 {
    14
}

fn default_cleanup_interval_hours() -> f64 {
    6.0
}

fn default_vacuum_interval_days() -> f64 {
    7.0
}

/// Pagination metadata for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub total_count: u64,
    pub page_number: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_previous: bool,
    pub next_offset: Option<u64>,
    pub previous_offset: Option<u64>,
}

impl PageInfo {
    pub fn new(total_count: u64, limit: u64, offset: u64) -> Self {
        let limit = limit.max(1);
        let total_pages = total_count.div_ceil(limit);
        let page_number = offset / limit + 1;
        let has_next = offset + limit < total_count;
        let has_previous = offset > 0;
        Self {
            total_count,
            page_number,
            total_pages,
            has_next,
            has_previous,
            next_offset: has_next.then_some(offset + limit),
            previous_offset: has_previous.then(|| offset.saturating_sub(limit)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub total_count: u64,
    pub earliest_ts: Option<DateTime<Local>>,
    pub latest_ts: Option<DateTime<Local>>,
    pub file_size_bytes: u64,
}

pub struct SnapshotStore {
    conn: Arc<parking_lot::Mutex<Connection>>,
    path: PathBuf,
}

impl SnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                model TEXT NOT NULL,
                slave_id INTEGER NOT NULL,
                device_type TEXT NOT NULL,
                sampling_ts INTEGER NOT NULL,
                is_online INTEGER NOT NULL,
                is_virtual INTEGER NOT NULL DEFAULT 0,
                values_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_device_ts
                ON snapshots(device_id, sampling_ts);
            CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON snapshots(sampling_ts);",
        )?;
        info!(path = %path.display(), "snapshot store opened");
        Ok(Self { conn: Arc::new(parking_lot::Mutex::new(conn)), path })
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            work(&conn)
        })
        .await
        .map_err(|_| StoreError::TaskGone)?
    }

    pub async fn insert(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let snapshot = snapshot.clone();
        self.blocking(move |conn| {
            let values_json =
                serde_json::to_string(&snapshot.values).unwrap_or_else(|_| "{}".to_owned());
            conn.execute(
                "INSERT INTO snapshots
                    (device_id, model, slave_id, device_type, sampling_ts,
                     is_online, is_virtual, values_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    snapshot.device_id,
                    snapshot.model,
                    snapshot.slave_id,
                    snapshot.device_type,
                    snapshot.sampling_ts.timestamp_millis(),
                    snapshot.is_online as i64,
                    snapshot.is_virtual as i64,
                    values_json,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// History page in sampling-time order.
    pub async fn get_time_range(
        &self,
        device_id: &str,
        start: DateTime<Local>,
        end: DateTime<Local>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Snapshot>, StoreError> {
        if start > end {
            return Err(StoreError::InvalidRange {
                start: start.timestamp_millis(),
                end: end.timestamp_millis(),
            });
        }
        let device_id = device_id.to_owned();
        self.blocking(move |conn| {
            let mut statement = conn.prepare(
                "SELECT device_id, model, slave_id, device_type, sampling_ts,
                        is_online, is_virtual, values_json
                 FROM snapshots
                 WHERE device_id = ?1 AND sampling_ts >= ?2 AND sampling_ts <= ?3
                 ORDER BY sampling_ts ASC
                 LIMIT ?4 OFFSET ?5",
            )?;
            let rows = statement.query_map(
                params![
                    device_id,
                    start.timestamp_millis(),
                    end.timestamp_millis(),
                    limit as i64,
                    offset as i64,
                ],
                row_to_snapshot,
            )?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
        .await
    }

    pub async fn count_in_time_range(
        &self,
        device_id: &str,
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> Result<u64, StoreError> {
        if start > end {
            return Err(StoreError::InvalidRange {
                start: start.timestamp_millis(),
                end: end.timestamp_millis(),
            });
        }
        let device_id = device_id.to_owned();
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM snapshots
                 WHERE device_id = ?1 AND sampling_ts >= ?2 AND sampling_ts <= ?3",
                params![device_id, start.timestamp_millis(), end.timestamp_millis()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    /// Newest rows for a device, newest first.
    pub async fn get_latest_by_device(
        &self,
        device_id: &str,
        limit: u64,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let device_id = device_id.to_owned();
        self.blocking(move |conn| {
            let mut statement = conn.prepare(
                "SELECT device_id, model, slave_id, device_type, sampling_ts,
                        is_online, is_virtual, values_json
                 FROM snapshots
                 WHERE device_id = ?1
                 ORDER BY sampling_ts DESC
                 LIMIT ?2",
            )?;
            let rows = statement.query_map(params![device_id, limit as i64], row_to_snapshot)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
        .await
    }

    /// All snapshots sampled within the trailing window.
    pub async fn get_all_recent(&self, minutes: u64) -> Result<Vec<Snapshot>, StoreError> {
        let cutoff = Local::now().timestamp_millis() - (minutes as i64) * 60_000;
        self.blocking(move |conn| {
            let mut statement = conn.prepare(
                "SELECT device_id, model, slave_id, device_type, sampling_ts,
                        is_online, is_virtual, values_json
                 FROM snapshots
                 WHERE sampling_ts >= ?1
                 ORDER BY sampling_ts ASC",
            )?;
            let rows = statement.query_map(params![cutoff], row_to_snapshot)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
        .await
    }

    pub async fn get_db_stats(&self) -> Result<DbStats, StoreError> {
        let file_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        self.blocking(move |conn| {
            let total_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
            let bounds: (Option<i64>, Option<i64>) = conn.query_row(
                "SELECT MIN(sampling_ts), MAX(sampling_ts) FROM snapshots",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(DbStats {
                total_count: total_count as u64,
                earliest_ts: bounds.0.and_then(millis_to_local),
                latest_ts: bounds.1.and_then(millis_to_local),
                file_size_bytes,
            })
        })
        .await
    }

    /// Delete rows sampled before `now - retention_days`.
    pub async fn cleanup_old_snapshots(&self, retention_days: u32) -> Result<u64, StoreError> {
        let cutoff =
            Local::now().timestamp_millis() - i64::from(retention_days) * 24 * 3600 * 1000;
        self.blocking(move |conn| {
            let deleted =
                conn.execute("DELETE FROM snapshots WHERE sampling_ts < ?1", params![cutoff])?;
            Ok(deleted as u64)
        })
        .await
    }

    pub async fn vacuum_database(&self) -> Result<(), StoreError> {
        self.blocking(|conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
        .await
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
    let sampling_millis: i64 = row.get(4)?;
    let values_json: String = row.get(7)?;
    Ok(Snapshot {
        device_id: row.get(0)?,
        model: row.get(1)?,
        slave_id: row.get(2)?,
        device_type: row.get(3)?,
        sampling_ts: millis_to_local(sampling_millis).unwrap_or_else(Local::now),
        is_online: row.get::<_, i64>(5)? != 0,
        is_virtual: row.get::<_, i64>(6)? != 0,
        values: serde_json::from_str(&values_json).unwrap_or_default(),
        source_device_ids: Vec::new(),
    })
}

fn millis_to_local(millis: i64) -> Option<DateTime<Local>> {
    Local.timestamp_millis_opt(millis).single()
}

/// Periodic retention cleanup, with a much slower vacuum cadence.
pub struct CleanupTask {
    store: Arc<SnapshotStore>,
    config: SnapshotStorageConfig,
}

impl CleanupTask {
    pub fn new(store: Arc<SnapshotStore>, config: SnapshotStorageConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let interval = Duration::from_secs_f64(self.config.cleanup_interval_hours * 3600.0);
        let vacuum_every = Duration::from_secs_f64(self.config.vacuum_interval_days * 86_400.0);
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_vacuum = tokio::time::Instant::now();

        info!(
            interval_hours = self.config.cleanup_interval_hours,
            retention_days = self.config.retention_days,
            "snapshot cleanup task started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }
            match self.store.cleanup_old_snapshots(self.config.retention_days).await {
                Ok(deleted) if deleted > 0 => info!(deleted, "old snapshots removed"),
                Ok(_) => {}
                Err(e) => warn!("snapshot cleanup failed: {e}"),
            }
            if last_vacuum.elapsed() >= vacuum_every {
                match self.store.vacuum_database().await {
                    Ok(()) => {
                        info!("snapshot database vacuumed");
                        last_vacuum = tokio::time::Instant::now();
                    }
                    Err(e) => warn!("vacuum failed: {e}"),
                }
            }
        }
        info!("snapshot cleanup task stopped");
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
