// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host facts reported in the gateway heartbeat: CPU temperature and a
//! persistent reboot counter.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CounterFile {
    reboot_count: u64,
}

pub struct SystemInfo {
    counter_path: PathBuf,
    thermal_path: PathBuf,
}

impl SystemInfo {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            counter_path: state_dir.into().join("reboot_count.json"),
            thermal_path: PathBuf::from(THERMAL_ZONE),
        }
    }

    #[cfg(test)]
    fn with_thermal_path(mut self, path: PathBuf) -> Self {
        self.thermal_path = path;
        self
    }

    /// CPU temperature in degrees Celsius; 0.0 when the thermal zone is
    /// unreadable (containers, non-Linux hosts).
    pub fn cpu_temperature(&self) -> f64 {
        match std::fs::read_to_string(&self.thermal_path) {
            Ok(raw) => raw.trim().parse::<f64>().map(|milli| milli / 1000.0).unwrap_or(0.0),
            Err(e) => {
                debug!("thermal zone unreadable: {e}");
                0.0
            }
        }
    }

    pub fn reboot_count(&self) -> u64 {
        self.read_counter().reboot_count
    }

    /// Bump and persist the reboot counter. Called once per sender start.
    pub fn increment_reboot_count(&self) -> u64 {
        let mut counter = self.read_counter();
        counter.reboot_count += 1;
        if let Some(parent) = self.counter_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec(&counter) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.counter_path, bytes) {
                    warn!(path = %self.counter_path.display(), "reboot counter write failed: {e}");
                }
            }
            Err(e) => warn!("reboot counter serialize failed: {e}"),
        }
        counter.reboot_count
    }

    fn read_counter(&self) -> CounterFile {
        std::fs::read_to_string(&self.counter_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }
}
