//! Communication Link Error Types
//!
//! Errors raised while framing, sending and decoding Modbus RTU traffic.

use thiserror::Error;

/// Result type for comlink operations
pub type Result<T> = std::result::Result<T, ComLinkError>;

/// Communication link errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComLinkError {
    /// Protocol-level errors (bad framing, CRC, unexpected function code)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection errors (port cannot be opened, stream closed)
    #[error("Connection error: {0}")]
    Connection(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Response payload does not match the request
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Exception response returned by the slave
    #[error("Modbus exception FC{function:02X}: code {code:02X}")]
    Exception { function: u8, code: u8 },
}

impl From<std::io::Error> for ComLinkError {
    fn from(err: std::io::Error) -> Self {
        ComLinkError::Io(err.to_string())
    }
}

impl From<tokio_serial::Error> for ComLinkError {
    fn from(err: tokio_serial::Error) -> Self {
        ComLinkError::Connection(err.to_string())
    }
}

// Helper methods for creating errors
impl ComLinkError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ComLinkError::Protocol(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        ComLinkError::Connection(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ComLinkError::Io(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ComLinkError::Timeout(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        ComLinkError::InvalidData(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ComLinkError::Config(msg.into())
    }

    /// Check if this error indicates the serial stream should be reopened
    pub fn needs_reconnect(&self) -> bool {
        match self {
            ComLinkError::Io(msg) => {
                msg.contains("Broken pipe")
                    || msg.contains("No such device")
                    || msg.contains("Input/output error")
            },
            ComLinkError::Connection(_) => true,
            _ => false,
        }
    }
}

/// Human-readable Modbus exception description
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_display() {
        let err = ComLinkError::Exception {
            function: 0x03,
            code: 0x02,
        };
        assert_eq!(
            err.to_string(),
            "Modbus exception FC03: code 02"
        );
        assert_eq!(exception_description(0x02), "Illegal Data Address");
    }

    #[test]
    fn test_needs_reconnect() {
        assert!(ComLinkError::connection("port gone").needs_reconnect());
        assert!(ComLinkError::io("Broken pipe (os error 32)").needs_reconnect());
        assert!(!ComLinkError::timeout("no response").needs_reconnect());
        assert!(!ComLinkError::Exception {
            function: 1,
            code: 2
        }
        .needs_reconnect());
    }
}
