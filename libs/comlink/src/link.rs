//! Modbus RTU link over a serial stream
//!
//! One request/response pair at a time. The link owns the stream mutably, so
//! exclusivity is enforced by whoever owns the link.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info};

use crate::codec::ModbusCodec;
use crate::error::{ComLinkError, Result};
use crate::frame::{
    build_rtu_frame, expected_response_len, frame_gap, parse_rtu_frame, MAX_FRAME_LEN,
};
use crate::pdu::{function, ModbusPdu, PduBuilder};

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Parity {
    #[default]
    #[serde(alias = "N", alias = "none")]
    None,
    #[serde(alias = "E", alias = "even")]
    Even,
    #[serde(alias = "O", alias = "odd")]
    Odd,
}

/// Serial port settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialSettings {
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    pub parity: Parity,
    /// Response timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19_200,
            data_bits: 8,
            stop_bits: 2,
            parity: Parity::None,
            timeout_ms: 5_000,
        }
    }
}

impl SerialSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(ComLinkError::config("Port path cannot be empty"));
        }
        if self.baud_rate == 0 {
            return Err(ComLinkError::config("Baud rate must be greater than zero"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ComLinkError::Config(format!(
                "Invalid data bits: {} (must be 5-8)",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ComLinkError::Config(format!(
                "Invalid stop bits: {} (must be 1 or 2)",
                self.stop_bits
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ComLinkError::config("Timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// RTU client link
#[derive(Debug)]
pub struct RtuLink<S> {
    stream: S,
    response_timeout: Duration,
    frame_gap: Duration,
}

impl RtuLink<SerialStream> {
    /// Open the serial port described by `settings`
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        settings.validate()?;
        debug!("RTU: {} @{}baud", settings.port, settings.baud_rate);

        let parity = match settings.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };

        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let stop_bits = match settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        match tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(settings.response_timeout())
            .open_native_async()
        {
            Ok(port) => {
                info!("RTU opened: {}", settings.port);
                Ok(Self::new(
                    port,
                    settings.response_timeout(),
                    frame_gap(settings.baud_rate),
                ))
            },
            Err(e) => {
                error!("RTU err: {} - {}", settings.port, e);
                Err(ComLinkError::Connection(format!(
                    "Failed to open serial port {}: {e}",
                    settings.port
                )))
            },
        }
    }
}

impl<S> RtuLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, response_timeout: Duration, frame_gap: Duration) -> Self {
        Self {
            stream,
            response_timeout,
            frame_gap,
        }
    }

    pub async fn read_coils(&mut self, unit: u8, start: u16, count: u16) -> Result<Vec<bool>> {
        self.read_bits(function::READ_COILS, unit, start, count)
            .await
    }

    pub async fn read_discrete_inputs(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>> {
        self.read_bits(function::READ_DISCRETE_INPUTS, unit, start, count)
            .await
    }

    pub async fn read_holding_registers(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.read_words(function::READ_HOLDING_REGISTERS, unit, start, count)
            .await
    }

    pub async fn read_input_registers(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.read_words(function::READ_INPUT_REGISTERS, unit, start, count)
            .await
    }

    pub async fn write_single_coil(&mut self, unit: u8, address: u16, value: bool) -> Result<()> {
        let request = ModbusCodec::build_write_single_coil(address, value)?;
        let response = self.transact(unit, &request).await?;
        let encoded = if value { 0xFF00 } else { 0x0000 };
        ModbusCodec::parse_write_echo(&response, function::WRITE_SINGLE_COIL, address, encoded)
    }

    pub async fn write_single_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<()> {
        let request = ModbusCodec::build_write_single_register(address, value)?;
        let response = self.transact(unit, &request).await?;
        ModbusCodec::parse_write_echo(&response, function::WRITE_SINGLE_REGISTER, address, value)
    }

    async fn read_bits(&mut self, fc: u8, unit: u8, start: u16, count: u16) -> Result<Vec<bool>> {
        let request = PduBuilder::build_read_request(fc, start, count)?;
        let response = self.transact(unit, &request).await?;
        ModbusCodec::parse_bits(&response, fc, count)
    }

    async fn read_words(&mut self, fc: u8, unit: u8, start: u16, count: u16) -> Result<Vec<u16>> {
        let request = PduBuilder::build_read_request(fc, start, count)?;
        let response = self.transact(unit, &request).await?;
        ModbusCodec::parse_words(&response, fc, count)
    }

    /// Send one request and wait for its response PDU
    pub async fn transact(&mut self, unit: u8, request: &ModbusPdu) -> Result<ModbusPdu> {
        let frame = build_rtu_frame(unit, request);
        self.send(&frame).await?;

        let received = timeout(self.response_timeout, self.receive_frame()).await;

        // Bus silence before the next request, whatever the outcome
        sleep(self.frame_gap).await;

        let frame = received.map_err(|_| {
            debug!("RTU timeout: unit {}", unit);
            ComLinkError::timeout(format!(
                "No response from unit {unit} within {:?}",
                self.response_timeout
            ))
        })??;

        parse_rtu_frame(&frame, unit)
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame).await.map_err(|e| {
            error!("RTU TX: {}", e);
            ComLinkError::Io(format!("Serial send error: {e}"))
        })?;
        self.stream.flush().await.map_err(|e| {
            error!("RTU flush: {}", e);
            ComLinkError::Io(format!("Serial flush error: {e}"))
        })?;
        debug!("RTU TX: {}B", frame.len());
        Ok(())
    }

    /// Read until the frame length implied by the header has arrived
    async fn receive_frame(&mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(MAX_FRAME_LEN);
        let mut chunk = [0u8; 128];

        loop {
            if let Some(total) = expected_response_len(&buffer)? {
                if total > MAX_FRAME_LEN {
                    return Err(ComLinkError::Protocol(format!(
                        "RTU frame length {total} exceeds maximum"
                    )));
                }
                if buffer.len() >= total {
                    buffer.truncate(total);
                    debug!("RTU RX: {}B", total);
                    return Ok(buffer);
                }
            }

            let n = self.stream.read(&mut chunk).await.map_err(|e| {
                error!("RTU RX: {}", e);
                ComLinkError::Io(format!("Serial read error: {e}"))
            })?;
            if n == 0 {
                error!("RTU closed");
                return Err(ComLinkError::connection("Serial connection closed"));
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
    }
}
