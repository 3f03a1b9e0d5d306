//! Register bus boundary
//!
//! `RegisterBus` is the contract every field bus implements: the Modbus RTU
//! client for real hardware and a register-map simulator. Nothing talks to a
//! bus directly; `BusGate` owns it and lets exactly one operation through at a
//! time, which is what a shared half-duplex line requires.

pub mod rtu;
pub mod sim;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use comlink::ComLinkError;
use tokio::sync::{Mutex, MutexGuard};

pub use rtu::ModbusRtuBus;
pub use sim::{SimHandle, SimWrite, SimulatedBus};

/// Result of a single bus operation
pub type BusResult<T> = std::result::Result<T, ComLinkError>;

/// Serialized read/write operations keyed by slave address.
///
/// Every call completes arbitration and the response (or a bus timeout)
/// before returning. Bit reads are LSB-first with index 0 at `start`; word
/// reads are big-endian on the wire.
#[async_trait]
pub trait RegisterBus: Send + Debug {
    async fn read_coil(&mut self, address: u16, slave: u8) -> BusResult<bool>;

    async fn write_coil(&mut self, address: u16, value: bool, slave: u8) -> BusResult<()>;

    async fn read_holding_register(&mut self, address: u16, slave: u8) -> BusResult<u16>;

    async fn write_holding_register(&mut self, address: u16, value: u16, slave: u8)
        -> BusResult<()>;

    async fn read_coils(&mut self, start: u16, count: u16, slave: u8) -> BusResult<Vec<bool>>;

    async fn read_discretes(&mut self, start: u16, count: u16, slave: u8)
        -> BusResult<Vec<bool>>;

    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
        slave: u8,
    ) -> BusResult<Vec<u16>>;

    async fn read_input_registers(
        &mut self,
        start: u16,
        count: u16,
        slave: u8,
    ) -> BusResult<Vec<u16>>;
}

/// Exclusive access to the shared bus.
///
/// Clones share the same bus. Each method holds the lock for exactly one
/// operation; `session` hands out the lock for read-modify-write sequences
/// that must not interleave with other callers.
#[derive(Debug, Clone)]
pub struct BusGate {
    bus: Arc<Mutex<Box<dyn RegisterBus>>>,
}

impl BusGate {
    pub fn new(bus: Box<dyn RegisterBus>) -> Self {
        Self {
            bus: Arc::new(Mutex::new(bus)),
        }
    }

    /// Hold the bus across several operations
    pub async fn session(&self) -> MutexGuard<'_, Box<dyn RegisterBus>> {
        self.bus.lock().await
    }

    pub async fn read_coil(&self, address: u16, slave: u8) -> BusResult<bool> {
        self.bus.lock().await.read_coil(address, slave).await
    }

    pub async fn write_coil(&self, address: u16, value: bool, slave: u8) -> BusResult<()> {
        self.bus.lock().await.write_coil(address, value, slave).await
    }

    pub async fn read_holding_register(&self, address: u16, slave: u8) -> BusResult<u16> {
        self.bus
            .lock()
            .await
            .read_holding_register(address, slave)
            .await
    }

    pub async fn write_holding_register(
        &self,
        address: u16,
        value: u16,
        slave: u8,
    ) -> BusResult<()> {
        self.bus
            .lock()
            .await
            .write_holding_register(address, value, slave)
            .await
    }

    pub async fn read_coils(&self, start: u16, count: u16, slave: u8) -> BusResult<Vec<bool>> {
        self.bus.lock().await.read_coils(start, count, slave).await
    }

    pub async fn read_discretes(&self, start: u16, count: u16, slave: u8) -> BusResult<Vec<bool>> {
        self.bus.lock().await.read_discretes(start, count, slave).await
    }

    pub async fn read_holding_registers(
        &self,
        start: u16,
        count: u16,
        slave: u8,
    ) -> BusResult<Vec<u16>> {
        self.bus
            .lock()
            .await
            .read_holding_registers(start, count, slave)
            .await
    }

    pub async fn read_input_registers(
        &self,
        start: u16,
        count: u16,
        slave: u8,
    ) -> BusResult<Vec<u16>> {
        self.bus
            .lock()
            .await
            .read_input_registers(start, count, slave)
            .await
    }
}
