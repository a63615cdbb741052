// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Store-and-forward cloud uplink: aligned tumbling-window batching, warm-up
//! send, outbox persistence, and deduplication.
//!
//! Every payload is persisted to the outbox BEFORE the POST. A successful
//! POST (HTTP 200 and a body containing "00000") deletes the file and
//! advances the per-device dedup clocks; a failure leaves the file for the
//! resend worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, TimeZone};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::outbox::{OutboxConfig, OutboxStore};
use crate::payload;
use crate::snapshot::Snapshot;
use crate::system_info::SystemInfo;

/// Warm-up: how long to wait for the first snapshot, then settle.
const WARMUP_TIMEOUT: Duration = Duration::from_secs(15);
const WARMUP_DEBOUNCE: Duration = Duration::from_secs(1);

/// Hard ceiling on how long the scheduler waits for one send before moving
/// on. The send itself is never cancelled.
const SCHEDULER_SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    pub gateway_id: String,
    #[serde(default = "default_series")]
    pub series: u32,
    pub ima_url: String,
    #[serde(default = "default_send_interval")]
    pub send_interval_sec: u64,
    #[serde(default)]
    pub anchor_offset_sec: u64,
    #[serde(default = "default_tick_grace")]
    pub tick_grace_sec: f64,
    #[serde(default = "default_fresh_window")]
    pub fresh_window_sec: f64,
    #[serde(default)]
    pub last_known_ttl_sec: f64,
    #[serde(default = "default_attempt_count")]
    pub attempt_count: u32,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_true")]
    pub fail_resend_enabled: bool,
    #[serde(default = "default_resend_interval")]
    pub fail_resend_interval_sec: u64,
    #[serde(default = "default_resend_batch")]
    pub fail_resend_batch: usize,
    #[serde(default)]
    pub resend_anchor_offset_sec: u64,
    #[serde(default = "default_resend_start_delay")]
    pub resend_start_delay_sec: u64,
    #[serde(default = "default_last_post_ok_within")]
    pub last_post_ok_within_sec: f64,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub outbox: OutboxConfig,
}

fn default_series() -> u32 {
    1
}

fn default_send_interval() -> u64 {
    60
}

fn default_tick_grace() -> f64 {
    1.0
}

fn default_fresh_window() -> f64 {
    300.0
}

fn default_attempt_count() -> u32 {
    3
}

fn default_max_retry() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_resend_interval() -> u64 {
    300
}

fn default_resend_batch() -> usize {
    10
}

fn default_resend_start_delay() -> u64 {
    30
}

fn default_last_post_ok_within() -> f64 {
    600.0
}

fn default_ssh_port() -> u16 {
    22
}

/// Result of one transport attempt.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub ok: bool,
    pub status: u16,
    pub body: String,
}

/// HTTP seam. Success = 200 and the body contains "00000".
#[async_trait]
pub trait ResendTransport: Send + Sync {
    async fn send(&self, payload: &Value) -> SendOutcome;
}

pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        info!("http transport created (connect=5s, total=10s)");
        Self { url: url.to_owned(), client }
    }
}

#[async_trait]
impl ResendTransport for HttpTransport {
    async fn send(&self, payload: &Value) -> SendOutcome {
        match self.client.post(&self.url).json(payload).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                SendOutcome { ok: status == 200 && body.contains("00000"), status, body }
            }
            Err(e) => SendOutcome { ok: false, status: 0, body: e.to_string() },
        }
    }
}

/// State shared between the sender and the resend worker.
pub struct UplinkShared {
    pub last_post_ok: parking_lot::Mutex<Option<DateTime<Local>>>,
    pub resend_wakeup: Notify,
}

impl Default for UplinkShared {
    fn default() -> Self {
        Self { last_post_ok: parking_lot::Mutex::new(None), resend_wakeup: Notify::new() }
    }
}

impl UplinkShared {
    pub fn record_post_ok(&self, when: DateTime<Local>) {
        *self.last_post_ok.lock() = Some(when);
        self.resend_wakeup.notify_one();
    }
}

/// Align a timestamp down to its tumbling window start.
pub fn window_start(ts: DateTime<Local>, interval_sec: u64) -> i64 {
    let interval = interval_sec.max(1) as i64;
    let epoch = ts.timestamp();
    (epoch / interval) * interval
}

/// Next aligned label strictly after `now`: `anchor + k * interval`.
pub fn next_label_time(
    now: DateTime<Local>,
    interval_sec: u64,
    anchor_offset_sec: u64,
) -> DateTime<Local> {
    let interval = interval_sec.max(1) as i64;
    let anchor = anchor_offset_sec as i64;
    let epoch = now.timestamp();
    let cycle = (epoch - anchor).div_euclid(interval);
    let mut next = (cycle + 1) * interval + anchor;
    while next <= epoch {
        next += interval;
    }
    Local.timestamp_opt(next, 0).single().unwrap_or(now)
}

pub struct Sender {
    config: SenderConfig,
    gateway_id: String,
    store: Arc<OutboxStore>,
    transport: Arc<dyn ResendTransport>,
    system_info: SystemInfo,
    shared: Arc<UplinkShared>,
    /// window start epoch -> device id -> latest snapshot in that window.
    buckets: parking_lot::Mutex<HashMap<i64, HashMap<String, Arc<Snapshot>>>>,
    last_sent_ts: parking_lot::Mutex<HashMap<String, DateTime<Local>>>,
    last_label_ts: parking_lot::Mutex<HashMap<String, DateTime<Local>>>,
    first_snapshot_seen: AtomicBool,
    first_snapshot: Notify,
    started: AtomicBool,
}

impl Sender {
    pub fn new(
        config: SenderConfig,
        store: Arc<OutboxStore>,
        transport: Arc<dyn ResendTransport>,
        shared: Arc<UplinkShared>,
        state_dir: &std::path::Path,
    ) -> Self {
        let gateway_id = payload::resolve_gateway_id(&config.gateway_id);
        Self {
            config,
            gateway_id,
            store,
            transport,
            system_info: SystemInfo::new(state_dir),
            shared,
            buckets: parking_lot::Mutex::new(HashMap::new()),
            last_sent_ts: parking_lot::Mutex::new(HashMap::new()),
            last_label_ts: parking_lot::Mutex::new(HashMap::new()),
            first_snapshot_seen: AtomicBool::new(false),
            first_snapshot: Notify::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn shared(&self) -> Arc<UplinkShared> {
        Arc::clone(&self.shared)
    }

    /// One-time startup side effects: the reboot counter bumps here, not in
    /// the constructor, so building a sender in tests is free of effects.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.system_info.increment_reboot_count();
        info!(gateway_id = %self.gateway_id, reboot_count = count, "sender started");
    }

    /// Bucket a snapshot into its tumbling window, keeping only the latest
    /// per device per window.
    pub fn handle_snapshot(&self, snapshot: Arc<Snapshot>) {
        let window = window_start(snapshot.sampling_ts, self.config.send_interval_sec);
        self.buckets
            .lock()
            .entry(window)
            .or_default()
            .insert(snapshot.device_id.clone(), snapshot);
        if !self.first_snapshot_seen.swap(true, Ordering::SeqCst) {
            // notify_one stores a permit, so the warm-up task cannot miss a
            // snapshot that arrives before it starts waiting.
            self.first_snapshot.notify_one();
        }
    }

    /// Warm-up: one immediate send after the first snapshot arrives.
    pub async fn warmup_run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.first_snapshot_seen.load(Ordering::SeqCst) {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.first_snapshot.notified() => {}
                _ = tokio::time::sleep(WARMUP_TIMEOUT) => {
                    debug!("warm-up: no snapshot within timeout, skipping immediate send");
                    return;
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(WARMUP_DEBOUNCE) => {}
        }
        let label = Local::now();
        info!("warm-up send");
        self.send_at_label(label, None).await;
    }

    /// Aligned periodic scheduler. Each send is shielded: the scheduler may
    /// give up waiting after 30 s, but the in-flight send keeps running so
    /// the outbox is never left half-written.
    pub async fn scheduler_run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval = self.config.send_interval_sec,
            anchor = self.config.anchor_offset_sec,
            grace = self.config.tick_grace_sec,
            "sender scheduler started"
        );
        let mut next_label =
            next_label_time(Local::now(), self.config.send_interval_sec, self.config.anchor_offset_sec);

        loop {
            let wait = (next_label - Local::now()).num_milliseconds().max(0) as u64;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
            }
            if self.config.tick_grace_sec > 0.0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs_f64(self.config.tick_grace_sec)) => {}
                }
            }

            let deadline =
                next_label + TimeDelta::milliseconds((self.config.tick_grace_sec * 1000.0) as i64);
            let sender = Arc::clone(&self);
            let label = next_label;
            let send_task = tokio::spawn(async move {
                sender.send_at_label(label, Some(deadline)).await;
            });
            match tokio::time::timeout(SCHEDULER_SEND_TIMEOUT, send_task).await {
                Ok(Ok(())) => debug!(label = %label.format("%H:%M:%S"), "scheduled send completed"),
                Ok(Err(e)) => error!("send task panicked: {e}"),
                Err(_) => {
                    // The send continues in its own task; only the wait ends.
                    error!(label = %label.format("%H:%M:%S"), "send exceeded 30s, continuing in background");
                }
            }

            next_label += TimeDelta::seconds(self.config.send_interval_sec as i64);
        }
        info!("sender scheduler stopped");
    }

    /// Collapse buckets, build one payload for the label, persist it, POST
    /// it, and on success advance the dedup clocks.
    pub async fn send_at_label(&self, label_time: DateTime<Local>, deadline: Option<DateTime<Local>>) {
        let (mut items, candidates) = self.collect_items(label_time, deadline);

        let heartbeat = payload::heartbeat_item(
            &self.gateway_id,
            self.config.series,
            label_time,
            self.config.ssh_port,
            self.system_info.cpu_temperature(),
            self.system_info.reboot_count(),
        );
        items.push(heartbeat);

        let payload = payload::wrap_items_as_payload(&self.gateway_id, items, label_time);
        let outbox_file = match self.store.persist_payload(&payload, label_time) {
            Ok(path) => path,
            Err(e) => {
                error!("outbox persist failed, skipping send: {e}");
                return;
            }
        };

        if self.post_with_retry(&payload).await {
            self.store.delete(&outbox_file);
            if !candidates.is_empty() {
                {
                    let mut last_label = self.last_label_ts.lock();
                    for device_id in candidates.keys() {
                        last_label.insert(device_id.clone(), label_time);
                    }
                }
                self.last_sent_ts.lock().extend(candidates);
                self.prune_buckets();
            }
        }
    }

    /// Latest snapshot per device across all windows.
    fn collect_latest_by_device(&self) -> HashMap<String, Arc<Snapshot>> {
        let buckets = self.buckets.lock();
        let mut latest: HashMap<String, Arc<Snapshot>> = HashMap::new();
        for bucket in buckets.values() {
            for (device_id, snapshot) in bucket {
                match latest.get(device_id) {
                    Some(existing) if existing.sampling_ts >= snapshot.sampling_ts => {}
                    _ => {
                        latest.insert(device_id.clone(), Arc::clone(snapshot));
                    }
                }
            }
        }
        latest
    }

    /// Items eligible for this label, with the per-device sampling times
    /// that a successful send will record.
    ///
    /// A device is included only when the label advances past its last label
    /// AND the sample advances past its last sent sample.
    pub fn collect_items(
        &self,
        label_time: DateTime<Local>,
        deadline: Option<DateTime<Local>>,
    ) -> (Vec<Value>, HashMap<String, DateTime<Local>>) {
        let latest = self.collect_latest_by_device();
        let mut items = Vec::new();
        let mut candidates = HashMap::new();

        for (device_id, snapshot) in latest {
            if let Some(deadline) = deadline {
                if snapshot.sampling_ts > deadline {
                    continue;
                }
            }
            if let Some(last_label) = self.last_label_ts.lock().get(&device_id) {
                if label_time <= *last_label {
                    continue;
                }
            }
            if let Some(last_sent) = self.last_sent_ts.lock().get(&device_id) {
                if snapshot.sampling_ts <= *last_sent {
                    continue;
                }
            }

            let age_ms = (label_time - snapshot.sampling_ts).num_milliseconds();
            let is_stale = age_ms as f64 / 1000.0 > self.config.fresh_window_sec;

            let mut item =
                payload::snapshot_to_item(&self.gateway_id, self.config.series, &snapshot);
            if let Some(data) = item.get_mut("Data").and_then(|d| d.as_object_mut()) {
                data.insert(
                    "sampling_datetime".to_owned(),
                    Value::String(snapshot.sampling_ts.to_rfc3339()),
                );
                data.insert("report_ts".to_owned(), Value::String(label_time.to_rfc3339()));
                data.insert("sample_age_ms".to_owned(), serde_json::json!(age_ms));
                if is_stale {
                    data.insert("is_stale".to_owned(), serde_json::json!(1));
                    data.insert("stale_age_ms".to_owned(), serde_json::json!(age_ms));
                }
            }
            items.push(item);
            candidates.insert(device_id, snapshot.sampling_ts);
        }
        (items, candidates)
    }

    /// POST with a short fixed backoff schedule. A success wakes the resend
    /// worker early; exhausting the attempts enforces the outbox budget.
    pub async fn post_with_retry(&self, payload: &Value) -> bool {
        let backoffs = [1u64, 2];
        let attempts = self.config.attempt_count.max(1);

        for attempt in 0..attempts {
            let outcome = self.transport.send(payload).await;
            if outcome.ok {
                debug!(attempt = attempt + 1, "post succeeded");
                self.shared.record_post_ok(Local::now());
                return true;
            }
            warn!(
                attempt = attempt + 1,
                status = outcome.status,
                preview = %outcome.body.chars().take(120).collect::<String>(),
                "post failed"
            );
            if (attempt as usize) < backoffs.len() && attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_secs(backoffs[attempt as usize])).await;
            }
        }
        warn!(attempts, "all post attempts exhausted");

        let store = Arc::clone(&self.store);
        let _ = tokio::task::spawn_blocking(move || store.enforce_budget()).await;
        false
    }

    /// Drop already-sent snapshots so the window cache cannot grow without
    /// bound.
    fn prune_buckets(&self) {
        let last_sent = self.last_sent_ts.lock().clone();
        let mut buckets = self.buckets.lock();
        for bucket in buckets.values_mut() {
            bucket.retain(|device_id, snapshot| {
                last_sent
                    .get(device_id)
                    .map(|sent| snapshot.sampling_ts > *sent)
                    .unwrap_or(true)
            });
        }
        buckets.retain(|_, bucket| !bucket.is_empty());
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().values().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;
