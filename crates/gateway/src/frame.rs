// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Modbus RTU frame encoding and decoding.
//!
//! Standard ADU layout: slave address, function code, payload, CRC-16 with
//! the low byte transmitted first. Function codes 01/02/03/04 (reads),
//! 05/06 (single writes), and 15 (write multiple coils) are supported.

use crate::error::{ExceptionCode, TransportError};
use crate::registers::RegisterType;

pub const FN_READ_COILS: u8 = 0x01;
pub const FN_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FN_READ_HOLDING: u8 = 0x03;
pub const FN_READ_INPUT: u8 = 0x04;
pub const FN_WRITE_COIL: u8 = 0x05;
pub const FN_WRITE_REGISTER: u8 = 0x06;
pub const FN_WRITE_COILS: u8 = 0x0F;

/// Function code used to read the given register class.
pub fn read_function(kind: RegisterType) -> u8 {
    match kind {
        RegisterType::Coil => FN_READ_COILS,
        RegisterType::DiscreteInput => FN_READ_DISCRETE_INPUTS,
        RegisterType::Holding => FN_READ_HOLDING,
        RegisterType::Input => FN_READ_INPUT,
    }
}

/// CRC-16/Modbus (poly 0xA001 reflected, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
}

/// Verify the trailing CRC of a received frame.
pub fn check_crc(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let crc = crc16(body);
    tail[0] == (crc & 0xFF) as u8 && tail[1] == (crc >> 8) as u8
}

/// Build a read request for `count` registers or bits starting at `addr`.
pub fn build_read(slave: u8, function: u8, addr: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![
        slave,
        function,
        (addr >> 8) as u8,
        (addr & 0xFF) as u8,
        (count >> 8) as u8,
        (count & 0xFF) as u8,
    ];
    append_crc(&mut frame);
    frame
}

/// Build a single-register (06) or single-coil (05) write request.
pub fn build_write_single(slave: u8, function: u8, addr: u16, value: u16) -> Vec<u8> {
    let mut frame = vec![
        slave,
        function,
        (addr >> 8) as u8,
        (addr & 0xFF) as u8,
        (value >> 8) as u8,
        (value & 0xFF) as u8,
    ];
    append_crc(&mut frame);
    frame
}

/// On-wire value for a single-coil write.
pub fn coil_value(on: bool) -> u16 {
    if on {
        0xFF00
    } else {
        0x0000
    }
}

/// Build a write-multiple-coils (15) request with LSB-first bit packing.
pub fn build_write_coils(slave: u8, addr: u16, values: &[bool]) -> Vec<u8> {
    let count = values.len() as u16;
    let byte_count = values.len().div_ceil(8) as u8;
    let mut frame = vec![
        slave,
        FN_WRITE_COILS,
        (addr >> 8) as u8,
        (addr & 0xFF) as u8,
        (count >> 8) as u8,
        (count & 0xFF) as u8,
        byte_count,
    ];
    let mut packed = vec![0u8; byte_count as usize];
    for (i, on) in values.iter().enumerate() {
        if *on {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    frame.extend_from_slice(&packed);
    append_crc(&mut frame);
    frame
}

/// A decoded response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Registers(Vec<u16>),
    Bits(Vec<bool>),
    WriteAck,
}

/// Decode a complete response frame for the given request function.
///
/// Returns `Ok(Err(code))` for a Modbus exception response; transport-level
/// corruption (bad CRC, wrong slave echo, truncation) is an `Err`.
pub fn parse_response(
    frame: &[u8],
    slave: u8,
    function: u8,
    count: u16,
) -> Result<Result<Payload, ExceptionCode>, TransportError> {
    if frame.len() < 4 {
        return Err(TransportError::ShortPayload(format!("{} bytes", frame.len())));
    }
    if !check_crc(frame) {
        return Err(TransportError::ShortPayload("crc mismatch".to_owned()));
    }
    if frame[0] != slave {
        return Err(TransportError::ShortPayload(format!(
            "slave mismatch: expected {slave}, got {}",
            frame[0]
        )));
    }
    if frame[1] == (function | 0x80) {
        return Ok(Err(ExceptionCode::from_code(frame[2])));
    }
    if frame[1] != function {
        return Err(TransportError::ShortPayload(format!(
            "function mismatch: expected {function}, got {}",
            frame[1]
        )));
    }

    match function {
        FN_READ_HOLDING | FN_READ_INPUT => {
            let byte_count = frame[2] as usize;
            let data = &frame[3..frame.len() - 2];
            if data.len() != byte_count || byte_count < count as usize * 2 {
                return Err(TransportError::ShortPayload(format!(
                    "expected {} data bytes, got {}",
                    count * 2,
                    data.len()
                )));
            }
            let words = data
                .chunks_exact(2)
                .take(count as usize)
                .map(|pair| (u16::from(pair[0]) << 8) | u16::from(pair[1]))
                .collect();
            Ok(Ok(Payload::Registers(words)))
        }
        FN_READ_COILS | FN_READ_DISCRETE_INPUTS => {
            let byte_count = frame[2] as usize;
            let data = &frame[3..frame.len() - 2];
            if data.len() != byte_count || byte_count < (count as usize).div_ceil(8) {
                return Err(TransportError::ShortPayload(format!(
                    "expected {} bit bytes, got {}",
                    (count as usize).div_ceil(8),
                    data.len()
                )));
            }
            let bits = (0..count as usize)
                .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
                .collect();
            Ok(Ok(Payload::Bits(bits)))
        }
        FN_WRITE_COIL | FN_WRITE_REGISTER | FN_WRITE_COILS => Ok(Ok(Payload::WriteAck)),
        other => Err(TransportError::ShortPayload(format!("unsupported function {other}"))),
    }
}

/// Expected total response length once the first three bytes are known.
///
/// Exception responses are always 5 bytes. Read responses carry a byte count
/// in the third byte; write echoes are fixed at 8 bytes.
pub fn expected_response_len(function: u8, third_byte: u8) -> usize {
    if function & 0x80 != 0 {
        return 5;
    }
    match function {
        FN_READ_COILS | FN_READ_DISCRETE_INPUTS | FN_READ_HOLDING | FN_READ_INPUT => {
            3 + third_byte as usize + 2
        }
        _ => 8,
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
