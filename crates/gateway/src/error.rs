// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy shared across the bus, device, and sender layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Modbus application-layer exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    Unknown(u8),
}

impl ExceptionCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::IllegalFunction,
            2 => Self::IllegalDataAddress,
            3 => Self::IllegalDataValue,
            4 => Self::SlaveDeviceFailure,
            5 => Self::Acknowledge,
            6 => Self::SlaveDeviceBusy,
            8 => Self::MemoryParityError,
            10 => Self::GatewayPathUnavailable,
            11 => Self::GatewayTargetFailed,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::IllegalFunction => 1,
            Self::IllegalDataAddress => 2,
            Self::IllegalDataValue => 3,
            Self::SlaveDeviceFailure => 4,
            Self::Acknowledge => 5,
            Self::SlaveDeviceBusy => 6,
            Self::MemoryParityError => 8,
            Self::GatewayPathUnavailable => 10,
            Self::GatewayTargetFailed => 11,
            Self::Unknown(c) => *c,
        }
    }

    /// Exception codes that indicate a device configuration problem rather
    /// than a bus fault. These never warrant a connection teardown.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::IllegalFunction | Self::IllegalDataAddress | Self::IllegalDataValue
        )
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exception code {}", self.code())
    }
}

/// Transport-level faults on the serial link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("serial port i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port: {0}")]
    Serial(String),
    #[error("not connected")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
    #[error("malformed response: {0}")]
    ShortPayload(String),
}

/// Configuration problems detected at load time. A rule or mapping that fails
/// validation is logged and excluded; the subsystem keeps running.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Snapshot store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store task was dropped before completing")]
    TaskGone,
    #[error("invalid time range: start {start} > end {end}")]
    InvalidRange { start: i64, end: i64 },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
