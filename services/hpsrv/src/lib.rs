//! Heat pump supervisory service
//!
//! Polls a heat pump and its pump controller over a shared Modbus RTU bus,
//! publishes snapshot changes to WebSocket observers, supervises inverter and
//! flow faults with bounded recovery sequences and exposes operator commands
//! over HTTP.

pub mod api;
pub mod bus;
pub mod config;
pub mod datalog;
pub mod engine;
pub mod error;
pub mod fault;
pub mod hub;
pub mod notify;
pub mod plant;
pub mod poll;
pub mod recovery;
pub mod registers;
pub mod snapshot;

pub use error::{HpSrvError, Result};
