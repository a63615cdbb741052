// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serial transport seam.
//!
//! `ModbusLink` is the capability surface the bus layer talks to. The real
//! implementation drives an RS-485 adapter through `tokio-serial`; tests use
//! a scripted fake. Clearing the RX buffer is a required capability — stale
//! frames from one slave must never be parsed as another slave's response.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use crate::error::{ExceptionCode, TransportError};
use crate::frame;
use crate::registers::RegisterType;

/// Outer error = transport fault, inner error = Modbus exception response.
pub type LinkResult<T> = Result<Result<T, ExceptionCode>, TransportError>;

/// Transport capability surface for one physical serial port.
///
/// Implementations are not required to be internally synchronized; the bus
/// layer holds the port mutex for the whole request/response cycle.
#[async_trait]
pub trait ModbusLink: Send {
    /// Open the port if not already open. Idempotent.
    async fn open(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&mut self);

    /// Discard any unread bytes in the RX buffer. Returns false when the
    /// buffer could not be reached (port closed).
    fn clear_rx(&mut self) -> bool;

    async fn read_registers(
        &mut self,
        slave: u8,
        kind: RegisterType,
        addr: u16,
        count: u16,
    ) -> LinkResult<Vec<u16>>;

    async fn read_bits(
        &mut self,
        slave: u8,
        kind: RegisterType,
        addr: u16,
        count: u16,
    ) -> LinkResult<Vec<bool>>;

    async fn write_register(&mut self, slave: u8, addr: u16, value: u16) -> LinkResult<()>;

    async fn write_coil(&mut self, slave: u8, addr: u16, on: bool) -> LinkResult<()>;

    async fn write_coils(&mut self, slave: u8, addr: u16, values: &[bool]) -> LinkResult<()>;
}

/// Serial port parameters for one RS-485 segment.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SerialSettings {
    pub path: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Response timeout per request, milliseconds.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn default_baud() -> u32 {
    9600
}

fn default_response_timeout_ms() -> u64 {
    1000
}

/// RTU link over a `tokio-serial` stream.
pub struct SerialLink {
    settings: SerialSettings,
    stream: Option<SerialStream>,
}

impl SerialLink {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings, stream: None }
    }

    fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.response_timeout_ms)
    }

    async fn transact(
        &mut self,
        request: &[u8],
        slave: u8,
        function: u8,
        count: u16,
    ) -> LinkResult<frame::Payload> {
        let timeout = self.response_timeout();
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::Disconnected);
        };

        stream.write_all(request).await?;
        stream.flush().await?;

        let response = tokio::time::timeout(timeout, read_response(stream, function))
            .await
            .map_err(|_| TransportError::Timeout)??;

        frame::parse_response(&response, slave, function, count)
    }
}

/// Read one complete response frame: a 3-byte header determines the total
/// length (exception, read payload, or fixed-size write echo).
async fn read_response(stream: &mut SerialStream, _function: u8) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;

    let total = frame::expected_response_len(header[1], header[2]);
    let mut response = header.to_vec();
    if total > 3 {
        let mut rest = vec![0u8; total - 3];
        stream.read_exact(&mut rest).await?;
        response.extend_from_slice(&rest);
    }
    Ok(response)
}

#[async_trait]
impl ModbusLink for SerialLink {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio_serial::new(&self.settings.path, self.settings.baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::Serial(e.to_string()))?;
        debug!(port = %self.settings.path, baud = self.settings.baud_rate, "serial port opened");
        self.stream = Some(stream);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(port = %self.settings.path, "serial port closed");
        }
    }

    fn clear_rx(&mut self) -> bool {
        match self.stream.as_mut() {
            Some(stream) => match stream.clear(ClearBuffer::Input) {
                Ok(()) => true,
                Err(e) => {
                    warn!(port = %self.settings.path, "rx buffer clear failed: {e}");
                    false
                }
            },
            None => false,
        }
    }

    async fn read_registers(
        &mut self,
        slave: u8,
        kind: RegisterType,
        addr: u16,
        count: u16,
    ) -> LinkResult<Vec<u16>> {
        let function = frame::read_function(kind);
        let request = frame::build_read(slave, function, addr, count);
        match self.transact(&request, slave, function, count).await? {
            Ok(frame::Payload::Registers(words)) => Ok(Ok(words)),
            Ok(other) => Err(TransportError::ShortPayload(format!("unexpected payload {other:?}"))),
            Err(code) => Ok(Err(code)),
        }
    }

    async fn read_bits(
        &mut self,
        slave: u8,
        kind: RegisterType,
        addr: u16,
        count: u16,
    ) -> LinkResult<Vec<bool>> {
        let function = frame::read_function(kind);
        let request = frame::build_read(slave, function, addr, count);
        match self.transact(&request, slave, function, count).await? {
            Ok(frame::Payload::Bits(bits)) => Ok(Ok(bits)),
            Ok(other) => Err(TransportError::ShortPayload(format!("unexpected payload {other:?}"))),
            Err(code) => Ok(Err(code)),
        }
    }

    async fn write_register(&mut self, slave: u8, addr: u16, value: u16) -> LinkResult<()> {
        let request = frame::build_write_single(slave, frame::FN_WRITE_REGISTER, addr, value);
        match self.transact(&request, slave, frame::FN_WRITE_REGISTER, 1).await? {
            Ok(_) => Ok(Ok(())),
            Err(code) => Ok(Err(code)),
        }
    }

    async fn write_coil(&mut self, slave: u8, addr: u16, on: bool) -> LinkResult<()> {
        let request =
            frame::build_write_single(slave, frame::FN_WRITE_COIL, addr, frame::coil_value(on));
        match self.transact(&request, slave, frame::FN_WRITE_COIL, 1).await? {
            Ok(_) => Ok(Ok(())),
            Err(code) => Ok(Err(code)),
        }
    }

    async fn write_coils(&mut self, slave: u8, addr: u16, values: &[bool]) -> LinkResult<()> {
        let request = frame::build_write_coils(slave, addr, values);
        match self.transact(&request, slave, frame::FN_WRITE_COILS, values.len() as u16).await? {
            Ok(_) => Ok(Ok(())),
            Err(code) => Ok(Err(code)),
        }
    }
}
