//! Modbus RTU framing
//!
//! Frame layout: `[unit id][PDU][CRC16 little-endian]`.

use std::time::Duration;

use tracing::debug;

use crate::error::{ComLinkError, Result};
use crate::pdu::{function, ModbusPdu};

/// Smallest valid RTU frame (unit + FC + exception code + CRC)
pub const MIN_FRAME_LEN: usize = 5;

/// Maximum RTU frame (unit + 253 byte PDU + CRC)
pub const MAX_FRAME_LEN: usize = 256;

/// Calculate CRC16 checksum (Modbus RTU standard)
pub fn calculate_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Build RTU frame (`unit_id` + PDU + CRC)
pub fn build_rtu_frame(unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());

    let crc = calculate_crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());

    debug!(
        "RTU frame: unit={}, FC={:02X}, PDU_len={}, CRC={:04X}",
        unit_id,
        pdu.function_code().unwrap_or(0),
        pdu.len(),
        crc
    );
    frame
}

/// Parse RTU frame, checking CRC and the responding unit
pub fn parse_rtu_frame(data: &[u8], expected_unit: u8) -> Result<ModbusPdu> {
    if data.len() < MIN_FRAME_LEN - 1 {
        return Err(ComLinkError::protocol("RTU frame too short"));
    }

    let frame_len = data.len();
    let received_crc = u16::from_le_bytes([data[frame_len - 2], data[frame_len - 1]]);
    let calculated_crc = calculate_crc16(&data[..frame_len - 2]);
    if received_crc != calculated_crc {
        return Err(ComLinkError::Protocol(format!(
            "CRC mismatch: expected 0x{calculated_crc:04X}, got 0x{received_crc:04X}"
        )));
    }

    let unit_id = data[0];
    if unit_id != expected_unit {
        return Err(ComLinkError::Protocol(format!(
            "Response from unit {unit_id}, expected {expected_unit}"
        )));
    }

    ModbusPdu::from_slice(&data[1..frame_len - 2])
}

/// Total response frame length implied by the first bytes received.
///
/// Needs the unit id and function code, plus the byte count for reads.
/// Returns `Ok(None)` while more header bytes are required.
pub fn expected_response_len(header: &[u8]) -> Result<Option<usize>> {
    let Some(&fc) = header.get(1) else {
        return Ok(None);
    };

    if fc & 0x80 != 0 {
        // unit, fc, exception code, crc
        return Ok(Some(5));
    }

    match fc {
        function::READ_COILS
        | function::READ_DISCRETE_INPUTS
        | function::READ_HOLDING_REGISTERS
        | function::READ_INPUT_REGISTERS => {
            Ok(header.get(2).map(|&count| 3 + count as usize + 2))
        },
        // unit, fc, address, value, crc
        function::WRITE_SINGLE_COIL | function::WRITE_SINGLE_REGISTER => Ok(Some(8)),
        other => Err(ComLinkError::Protocol(format!(
            "Unsupported function code in response: {other:02X}"
        ))),
    }
}

/// Inter-frame silence of 3.5 character times (11 bits per character).
///
/// Above 19200 baud the protocol fixes the gap at 1.75 ms.
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return Duration::from_micros(1_750);
    }
    Duration::from_micros(38_500_000 / u64::from(baud_rate))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::pdu::PduBuilder;

    #[test]
    fn test_crc16_calculation() {
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(calculate_crc16(&data), 0x0A84);

        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(calculate_crc16(&data), 0xCDC5);
    }

    #[test]
    fn test_crc16_empty_data() {
        assert_eq!(calculate_crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_rtu_frame_build_parse() {
        let pdu = PduBuilder::build_read_request(0x03, 0x0000, 1).unwrap();
        let frame = build_rtu_frame(1, &pdu);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);

        let parsed = parse_rtu_frame(&frame, 1).unwrap();
        assert_eq!(parsed.as_slice(), pdu.as_slice());
    }

    #[test]
    fn test_rtu_parse_invalid_crc() {
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        frame[7] = 0x0B;
        let err = parse_rtu_frame(&frame, 1).unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn test_rtu_parse_wrong_unit() {
        let pdu = ModbusPdu::from_slice(&[0x01, 0x01, 0x00]).unwrap();
        let frame = build_rtu_frame(10, &pdu);
        assert!(parse_rtu_frame(&frame, 1).is_err());
        assert!(parse_rtu_frame(&frame, 10).is_ok());
    }

    #[test]
    fn test_rtu_parse_frame_too_short() {
        assert!(parse_rtu_frame(&[0x01, 0x03, 0x00], 1).is_err());
    }

    #[test]
    fn test_expected_response_len() {
        assert_eq!(expected_response_len(&[0x01]).unwrap(), None);
        assert_eq!(expected_response_len(&[0x01, 0x03]).unwrap(), None);
        assert_eq!(expected_response_len(&[0x01, 0x03, 0x38]).unwrap(), Some(61));
        assert_eq!(expected_response_len(&[0x01, 0x83]).unwrap(), Some(5));
        assert_eq!(expected_response_len(&[0x01, 0x05]).unwrap(), Some(8));
        assert!(expected_response_len(&[0x01, 0x2B]).is_err());
    }

    #[test]
    fn test_frame_gap() {
        // 3.5 chars * 11 bits at 19200 baud ~ 2.005 ms
        assert_eq!(frame_gap(19_200), Duration::from_micros(2_005));
        assert_eq!(frame_gap(115_200), Duration::from_micros(1_750));
    }
}
