//! Modbus RTU register bus

use std::fmt::Debug;

use async_trait::async_trait;
use comlink::{RtuLink, SerialSettings};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialStream;
use tracing::warn;

use super::{BusResult, RegisterBus};

/// `RegisterBus` over an RTU link
#[derive(Debug)]
pub struct ModbusRtuBus<S> {
    link: RtuLink<S>,
}

impl ModbusRtuBus<SerialStream> {
    /// Open the serial port and wrap it
    pub fn open(settings: &SerialSettings) -> BusResult<Self> {
        Ok(Self::new(RtuLink::open(settings)?))
    }
}

impl<S> ModbusRtuBus<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    pub fn new(link: RtuLink<S>) -> Self {
        Self { link }
    }
}

fn observe<T>(result: BusResult<T>, op: &str, slave: u8) -> BusResult<T> {
    if let Err(e) = &result {
        if e.needs_reconnect() {
            warn!("Serial link fault on {} (slave {}): {}", op, slave, e);
        }
    }
    result
}

#[async_trait]
impl<S> RegisterBus for ModbusRtuBus<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    async fn read_coil(&mut self, address: u16, slave: u8) -> BusResult<bool> {
        let bits = observe(self.link.read_coils(slave, address, 1).await, "read_coil", slave)?;
        Ok(bits.first().copied().unwrap_or(false))
    }

    async fn write_coil(&mut self, address: u16, value: bool, slave: u8) -> BusResult<()> {
        observe(
            self.link.write_single_coil(slave, address, value).await,
            "write_coil",
            slave,
        )
    }

    async fn read_holding_register(&mut self, address: u16, slave: u8) -> BusResult<u16> {
        let words = observe(
            self.link.read_holding_registers(slave, address, 1).await,
            "read_holding_register",
            slave,
        )?;
        Ok(words.first().copied().unwrap_or(0))
    }

    async fn write_holding_register(
        &mut self,
        address: u16,
        value: u16,
        slave: u8,
    ) -> BusResult<()> {
        observe(
            self.link.write_single_register(slave, address, value).await,
            "write_holding_register",
            slave,
        )
    }

    async fn read_coils(&mut self, start: u16, count: u16, slave: u8) -> BusResult<Vec<bool>> {
        observe(self.link.read_coils(slave, start, count).await, "read_coils", slave)
    }

    async fn read_discretes(
        &mut self,
        start: u16,
        count: u16,
        slave: u8,
    ) -> BusResult<Vec<bool>> {
        observe(
            self.link.read_discrete_inputs(slave, start, count).await,
            "read_discretes",
            slave,
        )
    }

    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
        slave: u8,
    ) -> BusResult<Vec<u16>> {
        observe(
            self.link.read_holding_registers(slave, start, count).await,
            "read_holding_registers",
            slave,
        )
    }

    async fn read_input_registers(
        &mut self,
        start: u16,
        count: u16,
        slave: u8,
    ) -> BusResult<Vec<u16>> {
        observe(
            self.link.read_input_registers(slave, start, count).await,
            "read_input_registers",
            slave,
        )
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use comlink::frame::build_rtu_frame;
    use comlink::pdu::ModbusPdu;
    use std::time::Duration;
    use tokio_test::io::Builder;

    fn frame(unit: u8, pdu: &[u8]) -> Vec<u8> {
        build_rtu_frame(unit, &ModbusPdu::from_slice(pdu).unwrap())
    }

    #[tokio::test]
    async fn test_single_register_read_and_coil_write() {
        let mock = Builder::new()
            // FC03 holding 24, one register
            .write(&frame(1, &[0x03, 0x00, 0x18, 0x00, 0x01]))
            .read(&frame(1, &[0x03, 0x02, 0x00, 0x01]))
            // FC05 coil 17 off
            .write(&frame(1, &[0x05, 0x00, 0x11, 0x00, 0x00]))
            .read(&frame(1, &[0x05, 0x00, 0x11, 0x00, 0x00]))
            .build();
        let link = RtuLink::new(mock, Duration::from_secs(1), Duration::ZERO);
        let mut bus = ModbusRtuBus::new(link);

        assert_eq!(bus.read_holding_register(24, 1).await.unwrap(), 1);
        bus.write_coil(17, false, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_discrete_block_read() {
        let mock = Builder::new()
            .write(&frame(10, &[0x02, 0x00, 0x01, 0x00, 0x04]))
            .read(&frame(10, &[0x02, 0x01, 0b0000_0110]))
            .build();
        let link = RtuLink::new(mock, Duration::from_secs(1), Duration::ZERO);
        let mut bus = ModbusRtuBus::new(link);

        assert_eq!(
            bus.read_discretes(1, 4, 10).await.unwrap(),
            vec![false, true, true, false]
        );
    }
}
