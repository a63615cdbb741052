// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Messages carried on the in-process pub/sub fabric.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;

/// Severity of an alert notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Edge kind of an alert notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertEdge {
    Triggered,
    Resolved,
}

impl AlertEdge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "TRIGGERED",
            Self::Resolved => "RESOLVED",
        }
    }
}

/// One alert state transition, published on the alert topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNotice {
    pub device_id: String,
    pub code: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub edge: AlertEdge,
    pub value: f64,
}

/// Message envelope for all topics.
#[derive(Debug, Clone)]
pub enum Event {
    Snapshot(Arc<Snapshot>),
    Alert(Arc<AlertNotice>),
}

impl Event {
    pub fn as_snapshot(&self) -> Option<&Arc<Snapshot>> {
        match self {
            Self::Snapshot(snap) => Some(snap),
            _ => None,
        }
    }

    pub fn as_alert(&self) -> Option<&Arc<AlertNotice>> {
        match self {
            Self::Alert(notice) => Some(notice),
            _ => None,
        }
    }
}
