//! Modbus request encoding and response decoding
//!
//! Response checks are strict: a payload whose byte count does not match the
//! request is rejected instead of partially decoded.

use tracing::warn;

use crate::error::{ComLinkError, Result};
use crate::pdu::{function, ModbusPdu, PduBuilder};

/// FC05 on/off encodings
const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

pub struct ModbusCodec;

impl ModbusCodec {
    /// Build write PDU for FC05 (Write Single Coil)
    pub fn build_write_single_coil(address: u16, value: bool) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(function::WRITE_SINGLE_COIL)?
            .address(address)?
            .word(if value { COIL_ON } else { COIL_OFF })?
            .build())
    }

    /// Build write PDU for FC06 (Write Single Register)
    pub fn build_write_single_register(address: u16, value: u16) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(function::WRITE_SINGLE_REGISTER)?
            .address(address)?
            .word(value)?
            .build())
    }

    /// Decode a FC01/FC02 response into `count` booleans
    pub fn parse_bits(pdu: &ModbusPdu, expected_fc: u8, count: u16) -> Result<Vec<bool>> {
        let data = Self::read_payload(pdu, expected_fc, count.div_ceil(8) as usize)?;
        Ok(unpack_bits(data, count as usize))
    }

    /// Decode a FC03/FC04 response into `count` words
    pub fn parse_words(pdu: &ModbusPdu, expected_fc: u8, count: u16) -> Result<Vec<u16>> {
        let data = Self::read_payload(pdu, expected_fc, count as usize * 2)?;
        Ok(unpack_words(data))
    }

    /// Verify a FC05/FC06 response echoes the request
    pub fn parse_write_echo(
        pdu: &ModbusPdu,
        expected_fc: u8,
        address: u16,
        value: u16,
    ) -> Result<()> {
        Self::check_function(pdu, expected_fc)?;

        let payload = pdu.payload();
        if payload.len() != 4 {
            return Err(ComLinkError::invalid_data(format!(
                "Write echo length {} (expected 4)",
                payload.len()
            )));
        }

        let echoed_address = u16::from_be_bytes([payload[0], payload[1]]);
        let echoed_value = u16::from_be_bytes([payload[2], payload[3]]);
        if echoed_address != address || echoed_value != value {
            warn!(
                "Write echo mismatch: sent {}={:04X}, got {}={:04X}",
                address, value, echoed_address, echoed_value
            );
            return Err(ComLinkError::invalid_data(format!(
                "Write echo mismatch at address {address}"
            )));
        }
        Ok(())
    }

    /// Validate function code and byte count, returning the data bytes
    fn read_payload(pdu: &ModbusPdu, expected_fc: u8, expected_bytes: usize) -> Result<&[u8]> {
        Self::check_function(pdu, expected_fc)?;

        let payload = pdu.payload();
        let Some((&byte_count, data)) = payload.split_first() else {
            return Err(ComLinkError::invalid_data("Response without byte count"));
        };

        if byte_count as usize != expected_bytes || data.len() != expected_bytes {
            return Err(ComLinkError::invalid_data(format!(
                "FC{:02X} byte count {} / {} data bytes (expected {})",
                expected_fc,
                byte_count,
                data.len(),
                expected_bytes
            )));
        }
        Ok(data)
    }

    fn check_function(pdu: &ModbusPdu, expected_fc: u8) -> Result<()> {
        let Some(fc) = pdu.function_code() else {
            return Err(ComLinkError::protocol("Empty response PDU"));
        };

        if pdu.is_exception() {
            return Err(ComLinkError::Exception {
                function: fc & 0x7F,
                code: pdu.exception_code().unwrap_or(0),
            });
        }

        if fc != expected_fc {
            return Err(ComLinkError::Protocol(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                expected_fc, fc
            )));
        }
        Ok(())
    }
}

/// Unpack LSB-first packed bits; index 0 is bit 0 of the first byte
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

/// Unpack big-endian 16-bit words; a trailing odd byte is ignored
pub fn unpack_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn pdu(bytes: &[u8]) -> ModbusPdu {
        ModbusPdu::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_build_fc05_on_off() {
        let on = ModbusCodec::build_write_single_coil(17, true).unwrap();
        assert_eq!(on.as_slice(), &[0x05, 0x00, 0x11, 0xFF, 0x00]);

        let off = ModbusCodec::build_write_single_coil(17, false).unwrap();
        assert_eq!(off.as_slice(), &[0x05, 0x00, 0x11, 0x00, 0x00]);
    }

    #[test]
    fn test_build_fc06() {
        let pdu = ModbusCodec::build_write_single_register(13, 125).unwrap();
        assert_eq!(pdu.as_slice(), &[0x06, 0x00, 0x0D, 0x00, 0x7D]);
    }

    #[test]
    fn test_unpack_bits_lsb_first() {
        // 0b0000_0101 -> coils 0 and 2 set; second byte bit 0 -> coil 8
        let bits = unpack_bits(&[0x05, 0x01], 10);
        assert_eq!(
            bits,
            vec![true, false, true, false, false, false, false, false, true, false]
        );
    }

    #[test]
    fn test_unpack_words_big_endian() {
        assert_eq!(unpack_words(&[0x01, 0x02, 0xFF, 0x00]), vec![0x0102, 0xFF00]);
        assert_eq!(unpack_words(&[0x01, 0x02, 0x03]), vec![0x0102]);
    }

    #[test]
    fn test_parse_bits_fc02() {
        let response = pdu(&[0x02, 0x01, 0x06]);
        let bits = ModbusCodec::parse_bits(&response, 0x02, 4).unwrap();
        assert_eq!(bits, vec![false, true, true, false]);
    }

    #[test]
    fn test_parse_words_fc03() {
        let response = pdu(&[0x03, 0x04, 0x00, 0x78, 0x00, 0x7D]);
        let words = ModbusCodec::parse_words(&response, 0x03, 2).unwrap();
        assert_eq!(words, vec![120, 125]);
    }

    #[test]
    fn test_parse_rejects_short_payload() {
        // Declares 4 bytes for 2 registers but only carries 2
        let response = pdu(&[0x04, 0x04, 0x00, 0x01]);
        let err = ModbusCodec::parse_words(&response, 0x04, 2).unwrap_err();
        assert!(matches!(err, ComLinkError::InvalidData(_)));

        // Single register read answered with one byte
        let response = pdu(&[0x03, 0x01, 0x00]);
        assert!(ModbusCodec::parse_words(&response, 0x03, 1).is_err());
    }

    #[test]
    fn test_parse_function_mismatch() {
        let response = pdu(&[0x01, 0x01, 0x00]);
        let err = ModbusCodec::parse_bits(&response, 0x02, 1).unwrap_err();
        assert!(matches!(err, ComLinkError::Protocol(_)));
    }

    #[test]
    fn test_parse_exception() {
        let response = pdu(&[0x83, 0x02]);
        let err = ModbusCodec::parse_words(&response, 0x03, 1).unwrap_err();
        assert_eq!(
            err,
            ComLinkError::Exception {
                function: 0x03,
                code: 0x02
            }
        );
    }

    #[test]
    fn test_parse_write_echo() {
        let echo = pdu(&[0x05, 0x00, 0x11, 0xFF, 0x00]);
        assert!(ModbusCodec::parse_write_echo(&echo, 0x05, 17, 0xFF00).is_ok());
        assert!(ModbusCodec::parse_write_echo(&echo, 0x05, 17, 0x0000).is_err());
        assert!(ModbusCodec::parse_write_echo(&echo, 0x06, 17, 0xFF00).is_err());
    }
}
