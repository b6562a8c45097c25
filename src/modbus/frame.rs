// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register frame decoding and command frame building.
//!
//! Fossibot devices speak a Modbus-flavoured dialect over MQTT payloads.
//! Three physical shapes arrive in practice:
//!
//! - **Write echo** (`fc = 0x06`): the 8-byte write request mirrored back,
//!   `[slave][0x06][regHi][regLo][valHi][valLo][crcHi][crcLo]`.
//! - **Request echo** (byte 2 = `0x00`): a 6-byte header carrying the
//!   big-endian start register and register count, followed by the
//!   register payload and a trailing 2-byte CRC. Register keys are
//!   absolute (start + index).
//! - **Bare data** (byte 2 = byte count): the payload follows the count
//!   byte directly with no start register; keys are 0-based indices and
//!   any trailing bytes are not covered by a validated CRC.

use std::collections::BTreeMap;

use crate::error::FrameError;

use super::crc::crc16;

/// Slave address used by every known Fossibot product.
pub const SLAVE_ID: u8 = 0x11;

/// Read holding registers (settings bank).
pub const FC_READ_HOLDING: u8 = 0x03;
/// Read input registers (live measurements bank).
pub const FC_READ_INPUT: u8 = 0x04;
/// Write a single register.
pub const FC_WRITE_SINGLE: u8 = 0x06;

/// Minimum size of any decodable frame.
const MIN_FRAME_LEN: usize = 8;

/// Which register bank a frame addresses, derived from its function code.
///
/// Both banks feed the same device state; the tag is retained for
/// observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Function code 0x03: settings.
    Holding,
    /// Everything else: live measurements.
    Input,
}

impl RegisterKind {
    /// Derives the bank tag from a wire function code.
    #[must_use]
    pub fn from_function_code(fc: u8) -> Self {
        if fc == FC_READ_HOLDING {
            Self::Holding
        } else {
            Self::Input
        }
    }
}

/// The logical content of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFrame {
    /// Slave address from byte 0.
    pub slave_id: u8,
    /// Function code from byte 1.
    pub function_code: u8,
    /// Absolute start register, when the physical shape carries one.
    pub start_register: Option<u16>,
    /// Register index to 16-bit value. Keys are absolute when
    /// `start_register` is known, 0-based otherwise.
    pub registers: BTreeMap<u16, u16>,
}

impl RegisterFrame {
    /// Looks up a register value by key.
    #[must_use]
    pub fn register(&self, index: u16) -> Option<u16> {
        self.registers.get(&index).copied()
    }

    /// The register bank this frame addresses.
    #[must_use]
    pub fn kind(&self) -> RegisterKind {
        RegisterKind::from_function_code(self.function_code)
    }
}

/// Decodes a raw payload into a [`RegisterFrame`].
///
/// # Errors
///
/// Returns [`FrameError`] when the buffer is shorter than 8 bytes, when a
/// declared size exceeds the buffer, when a register-bearing frame
/// declares zero registers, or when a shape that carries a CRC fails the
/// check.
pub fn decode(bytes: &[u8]) -> Result<RegisterFrame, FrameError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: bytes.len() });
    }

    let slave_id = bytes[0];
    let function_code = bytes[1];

    if function_code == FC_WRITE_SINGLE {
        return decode_write_echo(bytes, slave_id);
    }
    if bytes[2] == 0x00 {
        return decode_request_echo(bytes, slave_id, function_code);
    }
    decode_bare_data(bytes, slave_id, function_code)
}

/// 8-byte write request mirrored back by the device.
fn decode_write_echo(bytes: &[u8], slave_id: u8) -> Result<RegisterFrame, FrameError> {
    let register = u16::from_be_bytes([bytes[2], bytes[3]]);
    let value = u16::from_be_bytes([bytes[4], bytes[5]]);
    check_crc(&bytes[..6], &bytes[6..8])?;

    let mut registers = BTreeMap::new();
    registers.insert(register, value);
    Ok(RegisterFrame {
        slave_id,
        function_code: FC_WRITE_SINGLE,
        start_register: Some(register),
        registers,
    })
}

/// 6-byte request-echo header, register payload, trailing CRC.
fn decode_request_echo(
    bytes: &[u8],
    slave_id: u8,
    function_code: u8,
) -> Result<RegisterFrame, FrameError> {
    let start = u16::from_be_bytes([bytes[2], bytes[3]]);
    let count = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;

    let declared = 6 + count * 2 + 2;
    if declared > bytes.len() {
        return Err(FrameError::Truncated {
            declared,
            len: bytes.len(),
        });
    }
    if count == 0 && bytes.len() > MIN_FRAME_LEN {
        // An empty header-plus-CRC frame is legal; junk after it is not.
        return Err(FrameError::EmptyRegisterCount);
    }

    let payload = &bytes[6..6 + count * 2];
    check_crc(&bytes[..6 + count * 2], &bytes[6 + count * 2..6 + count * 2 + 2])?;

    let mut registers = BTreeMap::new();
    for (i, pair) in payload.chunks_exact(2).enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let key = start.wrapping_add(i as u16);
        registers.insert(key, u16::from_be_bytes([pair[0], pair[1]]));
    }
    Ok(RegisterFrame {
        slave_id,
        function_code,
        start_register: Some(start),
        registers,
    })
}

/// Byte-count header, payload follows directly, no validated CRC.
fn decode_bare_data(
    bytes: &[u8],
    slave_id: u8,
    function_code: u8,
) -> Result<RegisterFrame, FrameError> {
    let byte_count = bytes[2] as usize;
    if 3 + byte_count > bytes.len() {
        return Err(FrameError::Truncated {
            declared: 3 + byte_count,
            len: bytes.len(),
        });
    }
    if byte_count % 2 != 0 {
        return Err(FrameError::OddByteCount(byte_count));
    }

    let payload = &bytes[3..3 + byte_count];
    let mut registers = BTreeMap::new();
    for (i, pair) in payload.chunks_exact(2).enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        registers.insert(i as u16, u16::from_be_bytes([pair[0], pair[1]]));
    }
    Ok(RegisterFrame {
        slave_id,
        function_code,
        start_register: None,
        registers,
    })
}

fn check_crc(body: &[u8], trailer: &[u8]) -> Result<(), FrameError> {
    let computed = crc16(body);
    let found = u16::from_be_bytes([trailer[0], trailer[1]]);
    if computed == found {
        Ok(())
    } else {
        Err(FrameError::CrcMismatch { computed, found })
    }
}

/// Builds a write-single-register command frame.
#[must_use]
pub fn encode_write_single(register: u16, value: u16) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = SLAVE_ID;
    frame[1] = FC_WRITE_SINGLE;
    frame[2..4].copy_from_slice(&register.to_be_bytes());
    frame[4..6].copy_from_slice(&value.to_be_bytes());
    let crc = crc16(&frame[..6]);
    frame[6..8].copy_from_slice(&crc.to_be_bytes());
    frame
}

/// Builds a read-range request frame for `count` registers starting at
/// `start`, against the holding bank when `holding` is set, else the
/// input bank.
#[must_use]
pub fn encode_read_range(start: u16, count: u16, holding: bool) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = SLAVE_ID;
    frame[1] = if holding { FC_READ_HOLDING } else { FC_READ_INPUT };
    frame[2..4].copy_from_slice(&start.to_be_bytes());
    frame[4..6].copy_from_slice(&count.to_be_bytes());
    let crc = crc16(&frame[..6]);
    frame[6..8].copy_from_slice(&crc.to_be_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body).to_be_bytes());
        frame
    }

    #[test]
    fn write_single_round_trip() {
        let bytes = encode_write_single(24, 1);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.function_code, FC_WRITE_SINGLE);
        assert_eq!(frame.register(24), Some(1));
        assert_eq!(frame.start_register, Some(24));
    }

    #[test]
    fn write_single_round_trip_high_register() {
        // Register above 255 exercises the non-zero high byte path.
        let bytes = encode_write_single(0x0118, 0x0203);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.register(0x0118), Some(0x0203));
    }

    #[test]
    fn write_single_layout() {
        let bytes = encode_write_single(20, 15);
        assert_eq!(&bytes[..6], &[0x11, 0x06, 0x00, 0x14, 0x00, 0x0F]);
        let crc = crc16(&bytes[..6]);
        assert_eq!(bytes[6], (crc >> 8) as u8);
        assert_eq!(bytes[7], (crc & 0xFF) as u8);
    }

    #[test]
    fn read_range_function_codes() {
        assert_eq!(encode_read_range(0, 80, true)[1], FC_READ_HOLDING);
        assert_eq!(encode_read_range(0, 80, false)[1], FC_READ_INPUT);
    }

    #[test]
    fn too_short_is_rejected() {
        let err = decode(&[0x11, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00]).unwrap_err();
        assert_eq!(err, FrameError::TooShort { len: 7 });
    }

    #[test]
    fn empty_register_frame_decodes() {
        // Header + CRC only: a frame with no registers.
        let bytes = with_crc(&[0x11, 0x03, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(bytes.len(), 8);
        let frame = decode(&bytes).unwrap();
        assert!(frame.registers.is_empty());
        assert_eq!(frame.start_register, Some(0));
    }

    #[test]
    fn zero_count_with_payload_is_rejected() {
        let mut bytes = with_crc(&[0x11, 0x03, 0x00, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err, FrameError::EmptyRegisterCount);
    }

    #[test]
    fn request_echo_registers_are_start_keyed() {
        // Start register 40, two registers.
        let body = [0x11, 0x03, 0x00, 0x28, 0x00, 0x02, 0x00, 0x05, 0x00, 0x40];
        let frame = decode(&with_crc(&body)).unwrap();
        assert_eq!(frame.start_register, Some(40));
        assert_eq!(frame.register(40), Some(5));
        assert_eq!(frame.register(41), Some(0x40));
    }

    #[test]
    fn request_echo_truncated_payload_is_rejected() {
        // Declares 4 registers but carries only 2.
        let body = [0x11, 0x03, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02];
        let err = decode(&with_crc(&body)).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }

    #[test]
    fn request_echo_bad_crc_is_rejected() {
        let mut bytes = with_crc(&[0x11, 0x03, 0x00, 0x00, 0x00, 0x01, 0x12, 0x34]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::CrcMismatch { .. }));
    }

    #[test]
    fn bare_data_registers_are_index_keyed() {
        // fc 0x04 ack shape: byte count 4, two words, trailing CRC bytes
        // not validated.
        let bytes = [0x11, 0x04, 0x04, 0x00, 0x00, 0x00, 0x40, 0xDE, 0xAD];
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.start_register, None);
        assert_eq!(frame.register(0), Some(0x0000));
        assert_eq!(frame.register(1), Some(0x0040));
        assert_eq!(frame.kind(), RegisterKind::Input);
    }

    #[test]
    fn bare_data_truncated_is_rejected() {
        // Declares 16 payload bytes in an 8-byte buffer.
        let bytes = [0x11, 0x04, 0x10, 0x00, 0x00, 0x00, 0x40, 0x00];
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }

    #[test]
    fn full_state_frame_decodes_all_registers() {
        // 81-register dump as sent on the state topic.
        let mut body = vec![0x11, 0x03, 0x00, 0x00, 0x00, 0x51];
        for i in 0u16..81 {
            body.extend_from_slice(&i.to_be_bytes());
        }
        let frame = decode(&with_crc(&body)).unwrap();
        assert_eq!(frame.registers.len(), 81);
        assert_eq!(frame.register(56), Some(56));
        assert_eq!(frame.kind(), RegisterKind::Holding);
    }

    #[test]
    fn register_kind_from_function_code() {
        assert_eq!(RegisterKind::from_function_code(0x03), RegisterKind::Holding);
        assert_eq!(RegisterKind::from_function_code(0x04), RegisterKind::Input);
        assert_eq!(RegisterKind::from_function_code(0x06), RegisterKind::Input);
    }
}
