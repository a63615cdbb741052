// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: fake serial links and builders.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ExceptionCode, TransportError};
use crate::link::{LinkResult, ModbusLink};
use crate::registers::{RegisterSpec, RegisterType, WordFormat};

/// Everything the fake link observed, in order. Lets tests assert the
/// flush/settle/request discipline and connection lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Open,
    Close,
    ClearRx,
    ReadRegs { slave: u8, kind: RegisterType, addr: u16, count: u16 },
    ReadBits { slave: u8, kind: RegisterType, addr: u16, count: u16 },
    WriteReg { slave: u8, addr: u16, value: u16 },
    WriteCoil { slave: u8, addr: u16, on: bool },
    WriteCoils { slave: u8, addr: u16, values: Vec<bool> },
}

/// Next scripted outcome. When the script is empty, reads are served from
/// the register bank and writes succeed.
#[derive(Debug, Clone)]
pub enum Outcome {
    Registers(Vec<u16>),
    Bits(Vec<bool>),
    WriteOk,
    Exception(ExceptionCode),
    Timeout,
    Disconnect,
}

#[derive(Default)]
pub struct FakeLinkState {
    pub events: Mutex<Vec<LinkEvent>>,
    script: Mutex<VecDeque<Outcome>>,
    words: Mutex<HashMap<(u8, RegisterType, u16), u16>>,
    bits: Mutex<HashMap<(u8, RegisterType, u16), bool>>,
    open: AtomicBool,
    fail_open: AtomicBool,
}

impl FakeLinkState {
    pub fn push_outcome(&self, outcome: Outcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn set_word(&self, slave: u8, kind: RegisterType, addr: u16, value: u16) {
        self.words.lock().insert((slave, kind, addr), value);
    }

    pub fn set_bit(&self, slave: u8, kind: RegisterType, addr: u16, on: bool) {
        self.bits.lock().insert((slave, kind, addr), on);
    }

    pub fn word(&self, slave: u8, kind: RegisterType, addr: u16) -> Option<u16> {
        self.words.lock().get(&(slave, kind, addr)).copied()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Count of events matching a predicate.
    pub fn count_events(&self, predicate: impl Fn(&LinkEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    fn next_outcome(&self) -> Option<Outcome> {
        self.script.lock().pop_front()
    }
}

/// Scripted in-memory link. Clone the `Arc<FakeLinkState>` before boxing to
/// keep an inspection handle.
pub struct FakeLink {
    pub state: Arc<FakeLinkState>,
}

impl FakeLink {
    pub fn new() -> (Self, Arc<FakeLinkState>) {
        let state = Arc::new(FakeLinkState::default());
        (Self { state: Arc::clone(&state) }, state)
    }

    fn record(&self, event: LinkEvent) {
        self.state.events.lock().push(event);
    }
}

#[async_trait]
impl ModbusLink for FakeLink {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.state.fail_open.load(Ordering::Relaxed) {
            return Err(TransportError::Serial("no such device".to_owned()));
        }
        self.record(LinkEvent::Open);
        self.state.open.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Relaxed)
    }

    async fn close(&mut self) {
        if self.state.open.swap(false, Ordering::Relaxed) {
            self.record(LinkEvent::Close);
        }
    }

    fn clear_rx(&mut self) -> bool {
        self.record(LinkEvent::ClearRx);
        true
    }

    async fn read_registers(
        &mut self,
        slave: u8,
        kind: RegisterType,
        addr: u16,
        count: u16,
    ) -> LinkResult<Vec<u16>> {
        self.record(LinkEvent::ReadRegs { slave, kind, addr, count });
        match self.state.next_outcome() {
            Some(Outcome::Registers(words)) => Ok(Ok(words)),
            Some(Outcome::Exception(code)) => Ok(Err(code)),
            Some(Outcome::Timeout) => Err(TransportError::Timeout),
            Some(Outcome::Disconnect) => Err(TransportError::Disconnected),
            Some(_) => Ok(Ok(Vec::new())),
            None => {
                let bank = self.state.words.lock();
                Ok(Ok((addr..addr + count)
                    .map(|a| bank.get(&(slave, kind, a)).copied().unwrap_or(0))
                    .collect()))
            }
        }
    }

    async fn read_bits(
        &mut self,
        slave: u8,
        kind: RegisterType,
        addr: u16,
        count: u16,
    ) -> LinkResult<Vec<bool>> {
        self.record(LinkEvent::ReadBits { slave, kind, addr, count });
        match self.state.next_outcome() {
            Some(Outcome::Bits(bits)) => Ok(Ok(bits)),
            Some(Outcome::Exception(code)) => Ok(Err(code)),
            Some(Outcome::Timeout) => Err(TransportError::Timeout),
            Some(Outcome::Disconnect) => Err(TransportError::Disconnected),
            Some(_) => Ok(Ok(Vec::new())),
            None => {
                let bank = self.state.bits.lock();
                Ok(Ok((addr..addr + count)
                    .map(|a| bank.get(&(slave, kind, a)).copied().unwrap_or(false))
                    .collect()))
            }
        }
    }

    async fn write_register(&mut self, slave: u8, addr: u16, value: u16) -> LinkResult<()> {
        self.record(LinkEvent::WriteReg { slave, addr, value });
        match self.state.next_outcome() {
            Some(Outcome::Exception(code)) => Ok(Err(code)),
            Some(Outcome::Timeout) => Err(TransportError::Timeout),
            Some(Outcome::Disconnect) => Err(TransportError::Disconnected),
            _ => {
                self.state.words.lock().insert((slave, RegisterType::Holding, addr), value);
                Ok(Ok(()))
            }
        }
    }

    async fn write_coil(&mut self, slave: u8, addr: u16, on: bool) -> LinkResult<()> {
        self.record(LinkEvent::WriteCoil { slave, addr, on });
        match self.state.next_outcome() {
            Some(Outcome::Exception(code)) => Ok(Err(code)),
            Some(Outcome::Timeout) => Err(TransportError::Timeout),
            Some(Outcome::Disconnect) => Err(TransportError::Disconnected),
            _ => {
                self.state.bits.lock().insert((slave, RegisterType::Coil, addr), on);
                Ok(Ok(()))
            }
        }
    }

    async fn write_coils(&mut self, slave: u8, addr: u16, values: &[bool]) -> LinkResult<()> {
        self.record(LinkEvent::WriteCoils { slave, addr, values: values.to_vec() });
        match self.state.next_outcome() {
            Some(Outcome::Exception(code)) => Ok(Err(code)),
            Some(Outcome::Timeout) => Err(TransportError::Timeout),
            Some(Outcome::Disconnect) => Err(TransportError::Disconnected),
            _ => {
                let mut bank = self.state.bits.lock();
                for (i, on) in values.iter().enumerate() {
                    bank.insert((slave, RegisterType::Coil, addr + i as u16), *on);
                }
                Ok(Ok(()))
            }
        }
    }
}

/// Builder for a readable holding-register pin.
pub fn holding_pin(offset: u16) -> RegisterSpec {
    RegisterSpec {
        offset,
        register_type: None,
        format: WordFormat::U16,
        bit: None,
        readable: true,
        writable: false,
        scale: 1.0,
        formula: None,
        precision: None,
        scale_from: None,
        composed_of: None,
    }
}

/// Builder for a writable holding-register pin.
pub fn rw_pin(offset: u16) -> RegisterSpec {
    let mut pin = holding_pin(offset);
    pin.writable = true;
    pin
}

/// Scripted cloud transport recording every payload it sees. Results are
/// consumed from the script in order; an empty script means success.
pub struct MockTransport {
    pub sent: parking_lot::Mutex<Vec<serde_json::Value>>,
    script: parking_lot::Mutex<VecDeque<bool>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: parking_lot::Mutex::new(Vec::new()),
            script: parking_lot::Mutex::new(VecDeque::new()),
        })
    }

    pub fn push_result(&self, ok: bool) {
        self.script.lock().push_back(ok);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl crate::sender::ResendTransport for MockTransport {
    async fn send(&self, payload: &serde_json::Value) -> crate::sender::SendOutcome {
        self.sent.lock().push(payload.clone());
        let ok = self.script.lock().pop_front().unwrap_or(true);
        if ok {
            crate::sender::SendOutcome { ok: true, status: 200, body: "00000".to_owned() }
        } else {
            crate::sender::SendOutcome { ok: false, status: 500, body: "error".to_owned() }
        }
    }
}
