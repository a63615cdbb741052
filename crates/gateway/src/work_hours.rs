// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Allowed-to-run schedules for schedule-expected-state alerts.
//!
//! A device with no schedule is allowed to run at any time.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One weekly window. Days use ISO numbering: 1 = Monday .. 7 = Sunday.
/// Times are "HH:MM"; an end before the start wraps past midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: Vec<u8>,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkHoursConfig {
    #[serde(default)]
    pub default: Vec<TimeWindow>,
    #[serde(default)]
    pub devices: HashMap<String, Vec<TimeWindow>>,
}

fn parse_minute(text: &str) -> Option<u32> {
    let (hours, minutes) = text.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Resolves whether a device is inside its allowed-to-run window.
pub struct WorkHoursEvaluator {
    config: WorkHoursConfig,
}

impl WorkHoursEvaluator {
    pub fn new(config: WorkHoursConfig) -> Self {
        Self { config }
    }

    pub fn allow(&self, device_id: &str) -> bool {
        self.allow_at(device_id, Local::now())
    }

    pub fn allow_at(&self, device_id: &str, now: DateTime<Local>) -> bool {
        let windows = self
            .config
            .devices
            .get(device_id)
            .filter(|w| !w.is_empty())
            .unwrap_or(&self.config.default);
        if windows.is_empty() {
            return true;
        }

        let weekday = now.weekday().number_from_monday() as u8;
        let minute = now.hour() * 60 + now.minute();

        windows.iter().any(|window| {
            if !window.days.contains(&weekday) {
                return false;
            }
            let (Some(start), Some(end)) = (parse_minute(&window.start), parse_minute(&window.end))
            else {
                warn!(device = device_id, "unparseable work-hours window, treating as closed");
                return false;
            };
            if start <= end {
                start <= minute && minute < end
            } else {
                // Overnight window.
                minute >= start || minute < end
            }
        })
    }
}
