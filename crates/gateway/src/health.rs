// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-device health tracking with cooldown backoff and quick probes.
//!
//! The monitor asks `should_poll` before touching a device. Unhealthy
//! devices are gated by an exponential cooldown; once the cooldown expires
//! they enter a recovery window where a cheap probe decides whether a full
//! read is worth the bus time.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::snapshot::{is_missing, now_ts};

/// Device types that need fast, non-exponential recovery.
const CRITICAL_DEVICE_TYPES: &[&str] = &["inverter"];

/// Estimated seconds to poll one critical device (probe + RS-485 turnaround).
const PER_DEVICE_POLL_SEC: f64 = 1.2;

/// Backoff parameters, either global defaults or per-device overrides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffParams {
    pub base_cooldown_sec: f64,
    pub max_cooldown_sec: f64,
    pub backoff_factor: f64,
    pub mark_unhealthy_after_failures: u32,
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self {
            base_cooldown_sec: 60.0,
            max_cooldown_sec: 180.0,
            backoff_factor: 2.0,
            mark_unhealthy_after_failures: 1,
        }
    }
}

/// Health manager configuration, loaded from file or derived from the poll
/// interval via [`HealthManager::calculate_health_params`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthConfig {
    pub base_cooldown_sec: f64,
    pub max_cooldown_sec: f64,
    pub backoff_factor: f64,
    #[serde(default)]
    pub jitter_sec: f64,
    pub mark_unhealthy_after_failures: u32,
    #[serde(default = "default_long_term_threshold")]
    pub long_term_offline_threshold_sec: f64,
    #[serde(default = "default_max_failures_cap")]
    pub max_failures_cap: u32,
}

fn default_long_term_threshold() -> f64 {
    3600.0
}

fn default_max_failures_cap() -> u32 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            base_cooldown_sec: 60.0,
            max_cooldown_sec: 180.0,
            backoff_factor: 2.0,
            jitter_sec: 0.0,
            mark_unhealthy_after_failures: 1,
            long_term_offline_threshold_sec: 3600.0,
            max_failures_cap: 5,
        }
    }
}

/// Quick health check strategy per device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckStrategy {
    SingleRegister,
    PartialBulk,
    FullRead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub strategy: HealthCheckStrategy,
    #[serde(default)]
    pub registers: Vec<String>,
    #[serde(default = "default_check_timeout")]
    pub timeout_sec: f64,
    #[serde(default)]
    pub retry_on_failure: u32,
}

fn default_check_timeout() -> f64 {
    0.3
}

/// Result of one quick probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub device_id: String,
    pub is_online: bool,
    pub elapsed_ms: f64,
    pub strategy: &'static str,
    pub attempt: u32,
}

/// Mutable health record of one device.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub device_id: String,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_success_ts: Option<f64>,
    pub last_failure_ts: Option<f64>,
    pub last_check_ts: Option<f64>,
    pub next_allowed_poll_ts: f64,
    pub first_failure_ts: Option<f64>,
    pub last_recovery_attempt_ts: Option<f64>,
    pub overrides: Option<BackoffParams>,
}

impl HealthStatus {
    fn new(device_id: &str, overrides: Option<BackoffParams>) -> Self {
        Self {
            device_id: device_id.to_owned(),
            is_healthy: true,
            consecutive_failures: 0,
            last_success_ts: None,
            last_failure_ts: None,
            last_check_ts: None,
            next_allowed_poll_ts: 0.0,
            first_failure_ts: None,
            last_recovery_attempt_ts: None,
            overrides,
        }
    }

    fn mark_success(&mut self, now: f64) {
        self.is_healthy = true;
        self.last_success_ts = Some(now);
        self.consecutive_failures = 0;
        self.next_allowed_poll_ts = 0.0;
        self.last_check_ts = Some(now);
        self.first_failure_ts = None;
        self.last_recovery_attempt_ts = None;
    }

    fn mark_failure(&mut self, now: f64) {
        self.last_failure_ts = Some(now);
        self.consecutive_failures += 1;
        self.last_check_ts = Some(now);
        if self.first_failure_ts.is_none() {
            self.first_failure_ts = Some(now);
        }
    }
}

/// Read-only health summary for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub device_id: String,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_success_ts: Option<f64>,
    pub last_failure_ts: Option<f64>,
    pub last_check_ts: Option<f64>,
    pub next_allowed_poll_ts: f64,
    pub cooldown_remaining_sec: f64,
}

/// Centralized device health tracking. All state lives behind one lock.
pub struct HealthManager {
    state: parking_lot::Mutex<HashMap<String, HealthStatus>>,
    defaults: BackoffParams,
    jitter_sec: f64,
    long_term_offline_threshold: f64,
    max_failures_cap: u32,
    critical_params: parking_lot::Mutex<BackoffParams>,
    check_configs: parking_lot::Mutex<HashMap<String, HealthCheckConfig>>,
}

impl HealthManager {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            state: parking_lot::Mutex::new(HashMap::new()),
            defaults: BackoffParams {
                base_cooldown_sec: config.base_cooldown_sec,
                max_cooldown_sec: config.max_cooldown_sec,
                backoff_factor: config.backoff_factor,
                mark_unhealthy_after_failures: config.mark_unhealthy_after_failures,
            },
            jitter_sec: config.jitter_sec,
            long_term_offline_threshold: config.long_term_offline_threshold_sec,
            max_failures_cap: config.max_failures_cap,
            critical_params: parking_lot::Mutex::new(BackoffParams {
                base_cooldown_sec: 10.0,
                max_cooldown_sec: 10.0,
                backoff_factor: 1.0,
                mark_unhealthy_after_failures: 1,
            }),
            check_configs: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Derive critical-device backoff from the number of critical devices on
    /// the bus: their recovery attempts must not stack up past one full
    /// sequential polling pass.
    pub fn configure_for_device_list(&self, device_types: &[&str], poll_interval: f64) {
        let critical_count =
            device_types.iter().filter(|t| CRITICAL_DEVICE_TYPES.contains(*t)).count();
        if critical_count == 0 {
            info!("no critical devices found, using default backoff parameters");
            return;
        }
        let params = Self::calculate_critical_params(critical_count, poll_interval);
        info!(
            count = critical_count,
            base_cooldown_sec = params.base_cooldown_sec,
            max_cooldown_sec = params.max_cooldown_sec,
            "critical device backoff configured"
        );
        *self.critical_params.lock() = params;
    }

    pub fn register_device(&self, device_id: &str, device_type: Option<&str>) {
        let mut state = self.state.lock();
        if state.contains_key(device_id) {
            return;
        }
        let is_critical = device_type.map(|t| CRITICAL_DEVICE_TYPES.contains(&t)).unwrap_or(false);
        let overrides = is_critical.then(|| *self.critical_params.lock());
        if is_critical {
            info!(device = device_id, device_type = device_type.unwrap_or("unknown"), "registered critical device");
        } else {
            debug!(device = device_id, "registered device");
        }
        state.insert(device_id.to_owned(), HealthStatus::new(device_id, overrides));
    }

    pub fn register_health_check_config(&self, device_id: &str, config: HealthCheckConfig) {
        info!(device = device_id, strategy = ?config.strategy, "health check configured");
        self.check_configs.lock().insert(device_id.to_owned(), config);
    }

    /// Decide whether a device should be polled now.
    pub fn should_poll(&self, device_id: &str) -> (bool, String) {
        self.should_poll_at(device_id, now_ts())
    }

    pub fn should_poll_at(&self, device_id: &str, now: f64) -> (bool, String) {
        let mut state = self.state.lock();
        let status = state
            .entry(device_id.to_owned())
            .or_insert_with(|| HealthStatus::new(device_id, None));
        status.last_check_ts = Some(now);

        if status.is_healthy {
            return (true, "healthy".to_owned());
        }
        if now < status.next_allowed_poll_ts {
            let wait = status.next_allowed_poll_ts - now;
            return (false, format!("cooldown({wait:.1}s)"));
        }
        status.last_recovery_attempt_ts = Some(now);
        if let Some(first) = status.first_failure_ts {
            let offline = now - first;
            if offline > self.long_term_offline_threshold {
                debug!(
                    device = device_id,
                    offline_hours = offline / 3600.0,
                    "long-term offline device entering recovery"
                );
            }
        }
        (true, "recovery_window".to_owned())
    }

    pub fn mark_success(&self, device_id: &str) {
        self.mark_success_at(device_id, now_ts());
    }

    pub fn mark_success_at(&self, device_id: &str, now: f64) {
        let mut state = self.state.lock();
        let status = state
            .entry(device_id.to_owned())
            .or_insert_with(|| HealthStatus::new(device_id, None));
        let was_unhealthy = !status.is_healthy;
        status.mark_success(now);
        if was_unhealthy {
            info!(device = device_id, "device recovered (ONLINE)");
        }
    }

    pub fn mark_failure(&self, device_id: &str) {
        self.mark_failure_at(device_id, now_ts());
    }

    pub fn mark_failure_at(&self, device_id: &str, now: f64) {
        let mut state = self.state.lock();
        let status = state
            .entry(device_id.to_owned())
            .or_insert_with(|| HealthStatus::new(device_id, None));
        let was_healthy = status.is_healthy;
        status.mark_failure(now);

        let params = status.overrides.unwrap_or(self.defaults);
        let is_critical = params.backoff_factor <= 1.0;

        // Long-term-offline devices get their failure count capped so a
        // device that comes back after hours does not face a stale, maxed-out
        // cooldown ladder.
        if !is_critical {
            if let Some(first) = status.first_failure_ts {
                let offline = now - first;
                if offline > self.long_term_offline_threshold
                    && status.consecutive_failures > self.max_failures_cap
                {
                    let old = status.consecutive_failures;
                    status.consecutive_failures = self.max_failures_cap;
                    status.first_failure_ts = Some(now);
                    info!(
                        device = device_id,
                        offline_hours = offline / 3600.0,
                        from = old,
                        to = self.max_failures_cap,
                        "long-term offline, capping failure count"
                    );
                }
            }
        }

        if status.consecutive_failures >= params.mark_unhealthy_after_failures {
            status.is_healthy = false;
        }

        let cooldown = self.compute_cooldown(status, &params);
        status.next_allowed_poll_ts = now + cooldown;

        if was_healthy {
            warn!(
                device = device_id,
                failures = status.consecutive_failures,
                cooldown_sec = cooldown,
                "device marked unhealthy"
            );
        } else {
            debug!(
                device = device_id,
                failures = status.consecutive_failures,
                cooldown_sec = cooldown,
                "device still unhealthy"
            );
        }
    }

    pub fn is_healthy(&self, device_id: &str) -> bool {
        self.state.lock().get(device_id).map(|s| s.is_healthy).unwrap_or(true)
    }

    pub fn get_status(&self, device_id: &str) -> Option<HealthSummary> {
        let state = self.state.lock();
        state.get(device_id).map(|s| self.summarize(s, now_ts()))
    }

    pub fn get_all_summary(&self) -> HashMap<String, HealthSummary> {
        let now = now_ts();
        self.state
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), self.summarize(s, now)))
            .collect()
    }

    pub fn get_unhealthy_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .lock()
            .values()
            .filter(|s| !s.is_healthy)
            .map(|s| s.device_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Counts of configured quick-check strategies, for startup logging.
    pub fn get_health_check_summary(&self) -> HashMap<&'static str, usize> {
        let configs = self.check_configs.lock();
        let mut counts: HashMap<&'static str, usize> =
            HashMap::from([("single_register", 0), ("partial_bulk", 0), ("full_read", 0)]);
        for config in configs.values() {
            let key = match config.strategy {
                HealthCheckStrategy::SingleRegister => "single_register",
                HealthCheckStrategy::PartialBulk => "partial_bulk",
                HealthCheckStrategy::FullRead => "full_read",
            };
            *counts.entry(key).or_default() += 1;
        }
        counts
    }

    /// Probe a device using its configured strategy (or the fallback probe)
    /// and fold the outcome into the health state.
    pub async fn quick_health_check(&self, device: &Device, device_id: &str) -> HealthCheckResult {
        let config = self.check_configs.lock().get(device_id).cloned();
        let result = match config {
            Some(config) => self.perform_health_check(device, device_id, &config).await,
            None => self.fallback_quick_probe(device, device_id).await,
        };
        if result.is_online {
            self.mark_success(device_id);
        } else {
            self.mark_failure(device_id);
        }
        result
    }

    // ---- internals ----

    fn summarize(&self, status: &HealthStatus, now: f64) -> HealthSummary {
        HealthSummary {
            device_id: status.device_id.clone(),
            is_healthy: status.is_healthy,
            consecutive_failures: status.consecutive_failures,
            last_success_ts: status.last_success_ts,
            last_failure_ts: status.last_failure_ts,
            last_check_ts: status.last_check_ts,
            next_allowed_poll_ts: status.next_allowed_poll_ts,
            cooldown_remaining_sec: if status.is_healthy {
                0.0
            } else {
                (status.next_allowed_poll_ts - now).max(0.0)
            },
        }
    }

    /// `clamp(base * factor^(failures-1), 0, max)` with the exponent clamped
    /// through its logarithm so the power can never overflow to infinity.
    fn compute_cooldown(&self, status: &HealthStatus, params: &BackoffParams) -> f64 {
        let failures = status.consecutive_failures.max(1);
        let exp = failures - 1;

        let mut cooldown = if params.backoff_factor <= 1.0 || params.base_cooldown_sec <= 0.0 {
            params.base_cooldown_sec.min(params.max_cooldown_sec)
        } else {
            let log_max = f64::MAX.ln();
            let log_base = params.base_cooldown_sec.ln();
            let log_factor = params.backoff_factor.ln();
            let exp_max = if log_factor > 0.0 {
                ((log_max - log_base) / log_factor).floor().max(0.0) as u32
            } else {
                0
            };
            let safe_exp = exp.min(exp_max);
            if safe_exp < exp {
                warn!(
                    device = %status.device_id,
                    failures,
                    exp,
                    safe_exp,
                    "backoff exponent clamped"
                );
            }
            let backoff = params.base_cooldown_sec * params.backoff_factor.powi(safe_exp as i32);
            backoff.min(params.max_cooldown_sec)
        };

        if self.jitter_sec > 0.0 {
            cooldown = (cooldown + (rand::random::<f64>() * 2.0 - 1.0) * self.jitter_sec).max(0.0);
        }
        cooldown
    }

    async fn perform_health_check(
        &self,
        device: &Device,
        device_id: &str,
        config: &HealthCheckConfig,
    ) -> HealthCheckResult {
        let started = std::time::Instant::now();
        let mut is_online = false;
        let mut attempt = 0;

        for try_no in 0..=config.retry_on_failure {
            attempt = try_no + 1;
            is_online = match config.strategy {
                HealthCheckStrategy::SingleRegister => {
                    self.check_single_register(device, config).await
                }
                HealthCheckStrategy::PartialBulk => self.check_partial_bulk(device, config).await,
                HealthCheckStrategy::FullRead => Self::check_full_read(device).await,
            };
            if is_online {
                break;
            }
            if try_no < config.retry_on_failure {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        HealthCheckResult {
            device_id: device_id.to_owned(),
            is_online,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            strategy: match config.strategy {
                HealthCheckStrategy::SingleRegister => "single_register",
                HealthCheckStrategy::PartialBulk => "partial_bulk",
                HealthCheckStrategy::FullRead => "full_read",
            },
            attempt,
        }
    }

    async fn check_single_register(&self, device: &Device, config: &HealthCheckConfig) -> bool {
        let Some(register) = config.registers.first() else {
            warn!("single_register strategy has no registers configured, falling back to full read");
            return Self::check_full_read(device).await;
        };
        let timeout = Duration::from_secs_f64(config.timeout_sec);
        match tokio::time::timeout(timeout, device.read_value(register)).await {
            Ok(value) => !is_missing(value),
            Err(_) => false,
        }
    }

    /// Sequential per-register probe: any single success means ONLINE.
    async fn check_partial_bulk(&self, device: &Device, config: &HealthCheckConfig) -> bool {
        if config.registers.is_empty() {
            warn!("partial_bulk strategy requires register names");
            return false;
        }
        let timeout = Duration::from_secs_f64(config.timeout_sec);
        for register in &config.registers {
            if let Ok(value) = tokio::time::timeout(timeout, device.read_value(register)).await {
                if !is_missing(value) {
                    return true;
                }
            }
        }
        false
    }

    async fn check_full_read(device: &Device) -> bool {
        let values = device.read_all().await;
        values.values().any(|v| !is_missing(*v))
    }

    /// Probe used when no strategy is configured: first readable pin with a
    /// short timeout, else a bounded full read.
    async fn fallback_quick_probe(&self, device: &Device, device_id: &str) -> HealthCheckResult {
        let started = std::time::Instant::now();
        let first_readable = device.register_map.readable_pins().next().map(|(name, _)| name.clone());

        let is_online = match first_readable {
            Some(register) => {
                match tokio::time::timeout(
                    Duration::from_millis(300),
                    device.read_value(&register),
                )
                .await
                {
                    Ok(value) => !is_missing(value),
                    Err(_) => false,
                }
            }
            None => match tokio::time::timeout(Duration::from_millis(600), device.read_all()).await
            {
                Ok(values) => values.values().any(|v| !is_missing(*v)),
                Err(_) => false,
            },
        };

        HealthCheckResult {
            device_id: device_id.to_owned(),
            is_online,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            strategy: "fallback",
            attempt: 1,
        }
    }

    // ---- derived parameter helpers ----

    /// Health parameters matched to the monitor polling interval.
    pub fn calculate_health_params(poll_interval: f64) -> HealthConfig {
        if poll_interval <= 1.0 {
            return HealthConfig {
                base_cooldown_sec: 2.0,
                max_cooldown_sec: 120.0,
                backoff_factor: 2.0,
                jitter_sec: 0.2,
                mark_unhealthy_after_failures: 2,
                ..HealthConfig::default()
            };
        }
        let base_multiplier = if poll_interval <= 5.0 {
            2.0
        } else if poll_interval <= 10.0 {
            3.0
        } else {
            2.0
        };
        HealthConfig {
            base_cooldown_sec: poll_interval * base_multiplier,
            max_cooldown_sec: 180.0,
            backoff_factor: 2.0,
            jitter_sec: poll_interval * 0.2,
            mark_unhealthy_after_failures: 1,
            ..HealthConfig::default()
        }
    }

    /// Critical-device backoff derived from total sequential polling time so
    /// recovery attempts never pile up faster than the bus can serve them.
    pub fn calculate_critical_params(device_count: usize, poll_interval: f64) -> BackoffParams {
        if device_count == 0 {
            return BackoffParams {
                base_cooldown_sec: 10.0,
                max_cooldown_sec: 10.0,
                backoff_factor: 1.0,
                mark_unhealthy_after_failures: 1,
            };
        }
        let total_poll_time = device_count as f64 * PER_DEVICE_POLL_SEC;
        let base = ((total_poll_time * 1.2).max(poll_interval) * 10.0).round() / 10.0;
        BackoffParams {
            base_cooldown_sec: base,
            max_cooldown_sec: base * 2.0,
            backoff_factor: 1.0,
            mark_unhealthy_after_failures: 1,
        }
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
