//! Modbus RTU client link
//!
//! PDU building, RTU framing with CRC16, strict response decoding and a
//! serial link that performs one request/response exchange at a time.

pub mod codec;
pub mod error;
pub mod frame;
pub mod link;
pub mod pdu;

pub use error::{ComLinkError, Result};
pub use link::{Parity, RtuLink, SerialSettings};
