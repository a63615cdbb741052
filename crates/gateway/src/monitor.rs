// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic polling loop: health gate, bounded concurrent reads, virtual
//! enrichment, snapshot publishing.
//!
//! One device's failure never aborts a tick; its snapshot simply reports
//! offline with all values missing. The shared port mutex serializes actual
//! bus traffic regardless of read concurrency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::event::Event;
use crate::health::HealthManager;
use crate::manager::DeviceManager;
use crate::pubsub::{PubSub, Topic};
use crate::snapshot::Snapshot;
use crate::virtual_device::VirtualDeviceManager;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval")]
    pub interval_seconds: f64,
    #[serde(default = "default_device_timeout")]
    pub device_timeout_sec: f64,
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
    #[serde(default)]
    pub log_each_device: bool,
}

fn default_interval() -> f64 {
    5.0
}

fn default_device_timeout() -> f64 {
    3.0
}

fn default_read_concurrency() -> usize {
    4
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            device_timeout_sec: default_device_timeout(),
            read_concurrency: default_read_concurrency(),
            log_each_device: false,
        }
    }
}

pub struct Monitor {
    devices: Arc<DeviceManager>,
    health: Arc<HealthManager>,
    pubsub: Arc<PubSub<Event>>,
    virtual_devices: Option<Arc<VirtualDeviceManager>>,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(
        devices: Arc<DeviceManager>,
        health: Arc<HealthManager>,
        pubsub: Arc<PubSub<Event>>,
        virtual_devices: Option<Arc<VirtualDeviceManager>>,
        config: MonitorConfig,
    ) -> Self {
        Self { devices, health, pubsub, virtual_devices, config }
    }

    /// Poll loop. Cycle length is held at the configured interval by
    /// sleeping for the remainder of each tick.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval = self.config.interval_seconds,
            devices = self.devices.device_list().len(),
            read_concurrency = self.config.read_concurrency,
            "monitor started"
        );
        loop {
            let started = tokio::time::Instant::now();

            self.tick().await;

            let elapsed = started.elapsed();
            let budget = Duration::from_secs_f64(self.config.interval_seconds);
            let remaining = budget.saturating_sub(elapsed);
            if remaining.is_zero() {
                warn!(elapsed_sec = elapsed.as_secs_f64(), "poll cycle overran its interval");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
        info!("monitor stopped");
    }

    /// One polling pass over every device, then virtual enrichment and
    /// publication.
    pub async fn tick(&self) {
        let semaphore = Arc::new(Semaphore::new(self.config.read_concurrency.max(1)));
        let mut handles = Vec::new();

        for device in self.devices.device_list() {
            let device = Arc::clone(device);
            let health = Arc::clone(&self.health);
            let semaphore = Arc::clone(&semaphore);
            let timeout = Duration::from_secs_f64(self.config.device_timeout_sec);
            let log_each = self.config.log_each_device;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                poll_device(&device, &health, timeout, log_each).await
            }));
        }

        let mut physical: HashMap<String, Arc<Snapshot>> = HashMap::new();
        for result in futures_util::future::join_all(handles).await {
            match result {
                Ok(Some(snapshot)) => {
                    physical.insert(snapshot.device_id.clone(), Arc::new(snapshot));
                }
                Ok(None) => {}
                Err(e) => warn!("device poll task panicked: {e}"),
            }
        }

        let mut to_publish: Vec<Arc<Snapshot>> = physical.values().cloned().collect();
        if let Some(virtual_devices) = &self.virtual_devices {
            for snapshot in virtual_devices.compute_virtual_snapshots(&physical) {
                to_publish.push(Arc::new(snapshot));
            }
        }

        for snapshot in to_publish {
            self.pubsub.publish(Topic::DeviceSnapshot, Event::Snapshot(snapshot)).await;
        }
    }
}

/// Poll one device according to its health state. Returns `None` when the
/// device is inside its cooldown window (no snapshot this tick).
async fn poll_device(
    device: &Arc<Device>,
    health: &Arc<HealthManager>,
    timeout: Duration,
    log_each: bool,
) -> Option<Snapshot> {
    let device_id = device.device_id();
    let (allowed, reason) = health.should_poll(&device_id);
    if !allowed {
        debug!(device = %device_id, reason = %reason, "poll skipped");
        return None;
    }

    if reason == "recovery_window" {
        let result = health.quick_health_check(device, &device_id).await;
        if !result.is_online {
            debug!(
                device = %device_id,
                strategy = result.strategy,
                elapsed_ms = result.elapsed_ms,
                "recovery probe failed"
            );
            return Some(offline_snapshot(device));
        }
        info!(device = %device_id, "recovery probe succeeded, performing full read");
    }

    match tokio::time::timeout(timeout, device.read_all()).await {
        Ok(values) => {
            let online = values.values().any(|v| !crate::snapshot::is_missing(*v));
            if online {
                health.mark_success(&device_id);
            } else {
                health.mark_failure(&device_id);
            }
            if log_each {
                info!(device = %device_id, online, pins = values.len(), "device polled");
            }
            let mut snapshot = Snapshot::new(&device.model, device.slave_id, &device.device_type);
            snapshot.sampling_ts = Local::now();
            snapshot.values = values;
            snapshot.is_online = online;
            Some(snapshot)
        }
        Err(_) => {
            warn!(device = %device_id, timeout_sec = timeout.as_secs_f64(), "device read timed out");
            health.mark_failure(&device_id);
            Some(offline_snapshot(device))
        }
    }
}

fn offline_snapshot(device: &Device) -> Snapshot {
    let mut snapshot = Snapshot::new(&device.model, device.slave_id, &device.device_type);
    snapshot.sampling_ts = Local::now();
    snapshot.values = device.offline_snapshot();
    snapshot.is_online = false;
    snapshot
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
