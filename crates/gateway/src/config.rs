// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Industrial edge gateway for Modbus RTU field buses.
#[derive(Debug, Parser)]
#[command(name = "fieldgate", version, about)]
pub struct Config {
    /// Device, port, and register map configuration file (JSON).
    #[arg(long, env = "FIELDGATE_DEVICE_CONFIG")]
    pub device_config: PathBuf,

    /// Per-instance write constraints and startup frequencies.
    #[arg(long, env = "FIELDGATE_INSTANCE_CONFIG")]
    pub instance_config: Option<PathBuf>,

    /// Alert rule configuration.
    #[arg(long, env = "FIELDGATE_ALERT_CONFIG")]
    pub alert_config: Option<PathBuf>,

    /// Control rule configuration.
    #[arg(long, env = "FIELDGATE_CONTROL_CONFIG")]
    pub control_config: Option<PathBuf>,

    /// Virtual (aggregated) device configuration.
    #[arg(long, env = "FIELDGATE_VIRTUAL_DEVICE_CONFIG")]
    pub virtual_device_config: Option<PathBuf>,

    /// Cloud sender configuration. Omit to disable the uplink.
    #[arg(long, env = "FIELDGATE_SENDER_CONFIG")]
    pub sender_config: Option<PathBuf>,

    /// Snapshot storage configuration. Omit to disable persistence.
    #[arg(long, env = "FIELDGATE_STORAGE_CONFIG")]
    pub storage_config: Option<PathBuf>,

    /// Allowed-to-run schedules for schedule-expected-state alerts.
    #[arg(long, env = "FIELDGATE_WORK_HOURS_CONFIG")]
    pub work_hours_config: Option<PathBuf>,

    /// Health manager overrides. Defaults are derived from the poll interval.
    #[arg(long, env = "FIELDGATE_HEALTH_CONFIG")]
    pub health_config: Option<PathBuf>,

    /// Per-topic pub/sub queue policies.
    #[arg(long, env = "FIELDGATE_PUBSUB_CONFIG")]
    pub pubsub_config: Option<PathBuf>,

    /// Monitor poll interval in seconds.
    #[arg(long, env = "FIELDGATE_MONITOR_INTERVAL", default_value = "5.0")]
    pub monitor_interval: f64,

    /// Per-device read timeout in seconds.
    #[arg(long, env = "FIELDGATE_DEVICE_TIMEOUT", default_value = "3.0")]
    pub device_timeout: f64,

    /// Concurrent device reads per tick (bus traffic stays serialized).
    #[arg(long, env = "FIELDGATE_READ_CONCURRENCY", default_value = "4")]
    pub read_concurrency: usize,

    /// Log every device result per tick.
    #[arg(long, env = "FIELDGATE_LOG_EACH_DEVICE")]
    pub log_each_device: bool,

    /// State directory (execution store, reboot counter).
    #[arg(long, env = "FIELDGATE_STATE_DIR", default_value = "/var/lib/fieldgate")]
    pub state_dir: PathBuf,

    /// Log format (json or text).
    #[arg(long, env = "FIELDGATE_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "FIELDGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.monitor_interval <= 0.0 {
            anyhow::bail!("--monitor-interval must be positive");
        }
        if self.device_timeout <= 0.0 {
            anyhow::bail!("--device-timeout must be positive");
        }
        if self.read_concurrency == 0 {
            anyhow::bail!("--read-concurrency must be at least 1");
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("invalid log format: {}", self.log_format);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
