//! Modbus PDU data structure
//!
//! Fixed-size stack buffer so request building never allocates.

use tracing::debug;

use crate::error::{ComLinkError, Result};

/// Maximum PDU size defined by the Modbus application protocol
pub const MAX_PDU_SIZE: usize = 253;

/// Function codes used by the supervisory service
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
}

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ComLinkError::Protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();

        if let Some(fc) = pdu.function_code() {
            if pdu.is_exception() {
                debug!(
                    "PDU parsed: FC={:02X} (Exception: {}), code={:02X}",
                    fc,
                    function_code_description(fc),
                    pdu.exception_code().unwrap_or(0)
                );
            } else {
                debug!(
                    "PDU parsed: FC={:02X} ({}), data_len={}",
                    fc,
                    function_code_description(fc),
                    pdu.len - 1
                );
            }
        }

        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ComLinkError::Protocol("PDU buffer full".to_string()));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        let [hi, lo] = value.to_be_bytes();
        self.push(hi)?;
        self.push(lo)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte), exception bit included
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & 0x80 != 0)
            .unwrap_or(false)
    }

    /// Exception code of an exception response
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }

    /// Bytes after the function code
    #[inline]
    pub fn payload(&self) -> &[u8] {
        if self.len > 1 {
            &self.data[1..self.len]
        } else {
            &[]
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Get human-readable function code description
pub(crate) fn function_code_description(fc: u8) -> &'static str {
    match fc & 0x7F {
        function::READ_COILS => "Read Coils",
        function::READ_DISCRETE_INPUTS => "Read Discrete Inputs",
        function::READ_HOLDING_REGISTERS => "Read Holding Registers",
        function::READ_INPUT_REGISTERS => "Read Input Registers",
        function::WRITE_SINGLE_COIL => "Write Single Coil",
        function::WRITE_SINGLE_REGISTER => "Write Single Register",
        _ => "Unknown Function",
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> Result<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> Result<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    /// Add a big-endian word (quantity or register value)
    #[inline]
    pub fn word(mut self, value: u16) -> Result<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    #[inline]
    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            debug!(
                "PDU built: FC={:02X} ({}), total_len={}",
                fc,
                function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }

    /// Build a read request PDU for FC01-04
    pub fn build_read_request(fc: u8, start_address: u16, quantity: u16) -> Result<ModbusPdu> {
        if !matches!(fc, 0x01..=0x04) {
            return Err(ComLinkError::Protocol(format!(
                "build_read_request only supports FC01-04, got FC{:02X}",
                fc
            )));
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(start_address)?
            .word(quantity)?
            .build())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_pdu_basic_operations() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.is_empty());

        pdu.push(0x03).unwrap();
        pdu.push_u16(0x0100).unwrap();
        pdu.push_u16(0x000A).unwrap();

        assert_eq!(pdu.len(), 5);
        assert_eq!(pdu.function_code(), Some(0x03));
        assert!(!pdu.is_exception());
        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);
        assert_eq!(pdu.payload(), &[0x01, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn test_pdu_exception() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));
    }

    #[test]
    fn test_pdu_overflow() {
        let too_big = [0u8; MAX_PDU_SIZE + 1];
        assert!(ModbusPdu::from_slice(&too_big).is_err());

        let mut pdu = ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE]).unwrap();
        assert!(pdu.push(0x00).is_err());
    }

    #[test]
    fn test_build_read_request() {
        let pdu = PduBuilder::build_read_request(function::READ_COILS, 1, 138).unwrap();
        assert_eq!(pdu.as_slice(), &[0x01, 0x00, 0x01, 0x00, 0x8A]);

        let err = PduBuilder::build_read_request(function::WRITE_SINGLE_COIL, 1, 1);
        assert!(err.is_err());
    }
}
