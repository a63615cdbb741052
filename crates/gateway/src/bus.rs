// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cancel-safe Modbus transaction layer for a shared RS-485 port.
//!
//! Every request cycle holds the port mutex from RX flush through response
//! decode. The RX buffer is always cleared BEFORE the request goes out —
//! stale frames on a multi-drop bus otherwise get parsed as the wrong
//! slave's response. Connection teardown is selective: device configuration
//! exceptions keep the connection, transport faults and unknown exceptions
//! reset it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::{ExceptionCode, TransportError};
use crate::link::ModbusLink;
use crate::registers::RegisterType;

/// Delay between the RX flush and the request, letting the flush settle.
const SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Consecutive exchange errors tolerated before a busy slave forces a reset.
const MAX_ERRORS_BEFORE_RESET: u32 = 3;

/// Exclusive state of one physical serial port.
pub struct PortState {
    link: Box<dyn ModbusLink>,
    /// Set while a transaction is in flight. A transaction future dropped
    /// mid-exchange (cancellation) leaves this set, and the next acquirer
    /// performs a forced flush + reconnect before touching the wire.
    dirty: bool,
}

impl PortState {
    pub fn new(link: Box<dyn ModbusLink>) -> Self {
        Self { link, dirty: false }
    }

    pub async fn open(&mut self) -> Result<(), TransportError> {
        self.link.open().await
    }

    pub async fn close(&mut self) {
        self.link.close().await
    }
}

/// Handle to a port shared by every bus on the same RS-485 segment.
pub type SharedPort = Arc<Mutex<PortState>>;

pub fn shared_port(link: Box<dyn ModbusLink>) -> SharedPort {
    Arc::new(Mutex::new(PortState::new(link)))
}

/// One slave's view of a shared port, fixed to a register class.
///
/// A device holds one `Bus` per register class it touches; all of them share
/// the same port mutex.
pub struct Bus {
    port: SharedPort,
    slave_id: u8,
    register_type: RegisterType,
    consecutive_errors: AtomicU32,
}

impl Bus {
    pub fn new(port: SharedPort, slave_id: u8, register_type: RegisterType) -> Self {
        Self { port, slave_id, register_type, consecutive_errors: AtomicU32::new(0) }
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn register_type(&self) -> RegisterType {
        self.register_type
    }

    /// Read `count` 16-bit registers. `None` means the whole read failed and
    /// every covered pin takes the missing sentinel.
    pub async fn read_regs(&self, offset: u16, count: u16) -> Option<Vec<u16>> {
        if self.register_type.is_bit_type() {
            error!(slave = self.slave_id, "read_regs on bit register type");
            return None;
        }
        let mut port = self.port.lock().await;
        if !self.ensure_connected_locked(&mut port).await {
            error!(slave = self.slave_id, "connect failed, returning missing values");
            return None;
        }
        self.pre_request(&mut port).await;

        port.dirty = true;
        let result = port
            .link
            .read_registers(self.slave_id, self.register_type, offset, count)
            .await;
        port.dirty = false;

        match result {
            Ok(Ok(words)) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                Some(words)
            }
            Ok(Err(code)) => {
                self.handle_exception(&mut port, code, offset, count).await;
                None
            }
            Err(fault) => {
                self.handle_transport_fault(&mut port, fault).await;
                None
            }
        }
    }

    /// Read `count` coils or discrete inputs as 0/1 bits.
    pub async fn read_bits(&self, offset: u16, count: u16) -> Option<Vec<bool>> {
        if !self.register_type.is_bit_type() {
            error!(slave = self.slave_id, "read_bits on word register type");
            return None;
        }
        let mut port = self.port.lock().await;
        if !self.ensure_connected_locked(&mut port).await {
            error!(slave = self.slave_id, "connect failed, returning missing values");
            return None;
        }
        self.pre_request(&mut port).await;

        port.dirty = true;
        let result = port.link.read_bits(self.slave_id, self.register_type, offset, count).await;
        port.dirty = false;

        match result {
            Ok(Ok(bits)) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                Some(bits)
            }
            Ok(Err(code)) => {
                self.handle_exception(&mut port, code, offset, count).await;
                None
            }
            Err(fault) => {
                self.handle_transport_fault(&mut port, fault).await;
                None
            }
        }
    }

    pub async fn read_u16(&self, offset: u16) -> Option<u16> {
        self.read_regs(offset, 1).await.and_then(|words| words.first().copied())
    }

    pub async fn read_bit(&self, offset: u16) -> Option<bool> {
        self.read_bits(offset, 1).await.and_then(|bits| bits.first().copied())
    }

    /// Write a single 16-bit register.
    pub async fn write_u16(&self, offset: u16, value: u16) -> bool {
        let mut port = self.port.lock().await;
        if !self.ensure_connected_locked(&mut port).await {
            error!(slave = self.slave_id, "connect failed");
            return false;
        }
        self.pre_request(&mut port).await;

        port.dirty = true;
        let result = port.link.write_register(self.slave_id, offset, value).await;
        port.dirty = false;

        self.finish_write(&mut port, result, offset).await
    }

    pub async fn write_coil(&self, offset: u16, on: bool) -> bool {
        let mut port = self.port.lock().await;
        if !self.ensure_connected_locked(&mut port).await {
            error!(slave = self.slave_id, "connect failed");
            return false;
        }
        self.pre_request(&mut port).await;

        port.dirty = true;
        let result = port.link.write_coil(self.slave_id, offset, on).await;
        port.dirty = false;

        self.finish_write(&mut port, result, offset).await
    }

    pub async fn write_coils(&self, offset: u16, values: &[bool]) -> bool {
        let mut port = self.port.lock().await;
        if !self.ensure_connected_locked(&mut port).await {
            error!(slave = self.slave_id, "connect failed");
            return false;
        }
        self.pre_request(&mut port).await;

        port.dirty = true;
        let result = port.link.write_coils(self.slave_id, offset, values).await;
        port.dirty = false;

        self.finish_write(&mut port, result, offset).await
    }

    /// Idempotent connectivity check; reconnects under the port mutex.
    pub async fn ensure_connected(&self) -> bool {
        let mut port = self.port.lock().await;
        self.ensure_connected_locked(&mut port).await
    }

    // ---- internals ----

    async fn pre_request(&self, port: &mut PortState) {
        let cleared = port.link.clear_rx();
        if !cleared {
            debug!(slave = self.slave_id, "rx buffer clear unavailable");
        }
        tokio::time::sleep(SETTLE_DELAY).await;
    }

    async fn ensure_connected_locked(&self, port: &mut PortState) -> bool {
        if port.dirty {
            warn!(slave = self.slave_id, "port left dirty by an interrupted transaction, resetting");
            port.link.clear_rx();
            port.link.close().await;
            port.dirty = false;
        }
        if port.link.is_open() {
            return true;
        }
        // Pre-reconnect cleanup, then a fresh open.
        port.link.close().await;
        match port.link.open().await {
            Ok(()) => true,
            Err(e) => {
                warn!(slave = self.slave_id, "connect failed: {e}");
                false
            }
        }
    }

    async fn finish_write(
        &self,
        port: &mut PortState,
        result: crate::link::LinkResult<()>,
        offset: u16,
    ) -> bool {
        match result {
            Ok(Ok(())) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                true
            }
            Ok(Err(code)) => {
                self.handle_exception(port, code, offset, 1).await;
                false
            }
            Err(fault) => {
                self.handle_transport_fault(port, fault).await;
                false
            }
        }
    }

    /// Classify a Modbus exception response and apply the reset strategy.
    ///
    /// Configuration errors (illegal function/address/value) keep the
    /// connection — the error will persist and reconnecting wastes bus time.
    /// A busy slave keeps it until errors accumulate. Everything else resets.
    async fn handle_exception(
        &self,
        port: &mut PortState,
        code: ExceptionCode,
        offset: u16,
        count: u16,
    ) {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;

        if code.is_config_error() {
            debug!(slave = self.slave_id, offset, count, "device config error: {code}");
            self.reset_connection(port, false).await;
            return;
        }
        if code == ExceptionCode::SlaveDeviceBusy {
            debug!(slave = self.slave_id, "device busy");
            self.reset_connection(port, errors >= MAX_ERRORS_BEFORE_RESET).await;
            return;
        }
        warn!(slave = self.slave_id, offset, count, "modbus error: {code}");
        self.reset_connection(port, true).await;
    }

    async fn handle_transport_fault(&self, port: &mut PortState, fault: TransportError) {
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
        warn!(slave = self.slave_id, "transport error: {fault}");
        self.reset_connection(port, true).await;
    }

    /// Always clear the RX buffer; optionally close so the next request
    /// reconnects.
    async fn reset_connection(&self, port: &mut PortState, force_close: bool) {
        port.link.clear_rx();
        if force_close {
            port.link.close().await;
        } else {
            debug!(slave = self.slave_id, "buffer cleared, connection kept");
        }
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
