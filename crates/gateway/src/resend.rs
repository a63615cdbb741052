// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background replay of failed outbox files.
//!
//! Runs on its own aligned schedule, wakes early after any successful POST,
//! and backs off entirely while the cloud looks down (no recent success).
//! The worker is the sole deleter/renamer in the outbox directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::outbox::{label_from_filename, OutboxStore};
use crate::payload;
use crate::sender::{next_label_time, ResendTransport, SenderConfig, UplinkShared};

pub struct ResendWorker {
    config: SenderConfig,
    gateway_id: String,
    store: Arc<OutboxStore>,
    transport: Arc<dyn ResendTransport>,
    shared: Arc<UplinkShared>,
}

impl ResendWorker {
    pub fn new(
        config: SenderConfig,
        gateway_id: &str,
        store: Arc<OutboxStore>,
        transport: Arc<dyn ResendTransport>,
        shared: Arc<UplinkShared>,
    ) -> Self {
        Self { config, gateway_id: gateway_id.to_owned(), store, transport, shared }
    }

    /// Aligned loop with delayed start and early wake on POST success.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let start_delay = Duration::from_secs(self.config.resend_start_delay_sec);
        info!(
            interval = self.config.fail_resend_interval_sec,
            batch = self.config.fail_resend_batch,
            start_delay_sec = self.config.resend_start_delay_sec,
            health_window_sec = self.config.last_post_ok_within_sec,
            "resend worker scheduled"
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(start_delay) => {}
        }

        loop {
            let next_run = next_label_time(
                Local::now(),
                self.config.fail_resend_interval_sec,
                self.config.resend_anchor_offset_sec,
            );
            let wait = (next_run - Local::now()).num_milliseconds().max(0) as u64;
            debug!(next_run = %next_run.format("%H:%M:%S"), "resend worker waiting");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shared.resend_wakeup.notified() => {
                    debug!("resend worker woken early by post success");
                }
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
            }

            if !self.cloud_looks_healthy() {
                continue;
            }

            let (processed, succeeded) = self.process_batch(self.config.fail_resend_batch).await;
            if processed == 0 {
                debug!("resend worker found no files to process");
                continue;
            }
            info!(processed, succeeded, "resend batch finished");
            if succeeded > 0 {
                self.shared.resend_wakeup.notify_one();
            }
        }
        info!("resend worker stopped");
    }

    /// Skip replay while there has been no successful POST inside the health
    /// window: a down cloud should not get amplified load.
    fn cloud_looks_healthy(&self) -> bool {
        if self.config.last_post_ok_within_sec <= 0.0 {
            return true;
        }
        let last_ok = *self.shared.last_post_ok.lock();
        match last_ok {
            None => {
                info!("resend skipped: no successful post yet");
                false
            }
            Some(when) => {
                let elapsed = (Local::now() - when).num_milliseconds() as f64 / 1000.0;
                if elapsed > self.config.last_post_ok_within_sec {
                    info!(elapsed_sec = elapsed, "resend skipped: no recent post success");
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Replay the oldest eligible files: full packets go out as-is, loose
    /// items are grouped by label timestamp into one payload per group.
    pub async fn process_batch(&self, batch: usize) -> (usize, usize) {
        let files = self.store.pick_batch(batch, 0.0);
        if files.is_empty() {
            return (0, 0);
        }

        let mut processed = 0usize;
        let mut succeeded = 0usize;
        let mut full_packets: Vec<(PathBuf, Value)> = Vec::new();
        let mut groups: std::collections::BTreeMap<String, ItemGroup> = std::collections::BTreeMap::new();

        for path in files {
            processed += 1;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
                .unwrap_or_default();

            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(file = %name, "outbox file already gone");
                    continue;
                }
                Err(e) => {
                    warn!(file = %name, "outbox read failed: {e}");
                    self.retry_or_fail(&path);
                    continue;
                }
            };

            match serde_json::from_str::<Value>(&raw) {
                Ok(json) if json.get("FUNC").is_some() => {
                    full_packets.push((path, json));
                }
                Ok(json) if json.get("DeviceID").is_some() => {
                    let ts = json
                        .get("Data")
                        .and_then(|d| d.get("report_ts"))
                        .and_then(|v| v.as_str())
                        .and_then(parse_iso_local)
                        .or_else(|| label_from_filename(&name))
                        .unwrap_or_else(Local::now);
                    let key = ts.format("%Y%m%d%H%M%S").to_string();
                    let group = groups.entry(key).or_insert_with(|| ItemGroup {
                        ts,
                        items: Vec::new(),
                        paths: Vec::new(),
                    });
                    group.items.push(json);
                    group.paths.push(path);
                }
                _ => {
                    warn!(file = %name, "outbox file is neither packet nor item");
                    self.retry_or_fail(&path);
                }
            }
        }

        for (path, packet) in full_packets {
            let outcome = self.transport.send(&packet).await;
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            info!(file = %name, status = outcome.status, ok = outcome.ok, "resend packet");
            if outcome.ok {
                self.store.delete(&path);
                self.shared.record_post_ok(Local::now());
                succeeded += 1;
            } else {
                self.retry_or_fail(&path);
            }
        }

        for (key, group) in groups {
            let payload =
                payload::wrap_items_as_payload(&self.gateway_id, group.items, group.ts);
            let outcome = self.transport.send(&payload).await;
            info!(group = %key, files = group.paths.len(), ok = outcome.ok, "resend item group");
            if outcome.ok {
                for path in &group.paths {
                    self.store.delete(path);
                    succeeded += 1;
                }
                self.shared.record_post_ok(Local::now());
            } else {
                for path in &group.paths {
                    self.retry_or_fail(path);
                }
            }
        }

        let store = Arc::clone(&self.store);
        let _ = tokio::task::spawn_blocking(move || store.enforce_budget()).await;
        (processed, succeeded)
    }

    fn retry_or_fail(&self, path: &std::path::Path) {
        let (_, failed) = self.store.retry_or_fail(path, self.config.max_retry);
        if failed {
            warn!(file = %path.display(), "outbox file reached max retries");
        }
    }
}

struct ItemGroup {
    ts: DateTime<Local>,
    items: Vec<Value>,
    paths: Vec<PathBuf>,
}

fn parse_iso_local(raw: &str) -> Option<DateTime<Local>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Local))
}

#[cfg(test)]
#[path = "resend_tests.rs"]
mod tests;
