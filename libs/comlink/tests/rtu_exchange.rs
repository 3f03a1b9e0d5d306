//! RTU link against a scripted slave on an in-memory duplex stream
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::time::Duration;

use comlink::frame::{build_rtu_frame, calculate_crc16, parse_rtu_frame};
use comlink::pdu::ModbusPdu;
use comlink::{ComLinkError, RtuLink};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Answers every request with holding registers counting up from `base`,
/// echoes writes, and rejects reads beyond address 28.
async fn run_slave(mut stream: DuplexStream, unit: u8, base: u16) {
    let mut request = [0u8; 8];
    while stream.read_exact(&mut request).await.is_ok() {
        let pdu = parse_rtu_frame(&request, unit).unwrap();
        let bytes = pdu.as_slice();
        let start = u16::from_be_bytes([bytes[1], bytes[2]]);
        let count = u16::from_be_bytes([bytes[3], bytes[4]]);

        let response = match bytes[0] {
            0x03 if start + count <= 29 => {
                let mut out = vec![0x03, (count * 2) as u8];
                for i in 0..count {
                    out.extend_from_slice(&(base + start + i).to_be_bytes());
                }
                out
            },
            0x05 | 0x06 => bytes.to_vec(),
            fc => vec![fc | 0x80, 0x02],
        };

        let frame = build_rtu_frame(unit, &ModbusPdu::from_slice(&response).unwrap());
        stream.write_all(&frame).await.unwrap();
    }
}

fn client(stream: DuplexStream) -> RtuLink<DuplexStream> {
    RtuLink::new(stream, Duration::from_millis(500), Duration::ZERO)
}

#[tokio::test]
async fn test_sequential_reads_and_writes() {
    let (client_side, slave_side) = tokio::io::duplex(512);
    tokio::spawn(run_slave(slave_side, 1, 100));
    let mut link = client(client_side);

    let holdings = link.read_holding_registers(1, 1, 28).await.unwrap();
    assert_eq!(holdings.len(), 28);
    assert_eq!(holdings[0], 101);
    assert_eq!(holdings[27], 128);

    link.write_single_register(1, 13, 125).await.unwrap();
    link.write_single_coil(1, 17, false).await.unwrap();

    let status = link.read_holding_registers(1, 24, 2).await.unwrap();
    assert_eq!(status, vec![124, 125]);
}

#[tokio::test]
async fn test_out_of_range_read_is_an_exception() {
    let (client_side, slave_side) = tokio::io::duplex(512);
    tokio::spawn(run_slave(slave_side, 10, 0));
    let mut link = client(client_side);

    let err = link.read_holding_registers(10, 20, 16).await.unwrap_err();
    assert!(matches!(err, ComLinkError::Exception { function: 0x03, code: 0x02 }));

    // Link stays usable after an exception
    assert_eq!(link.read_holding_registers(10, 1, 1).await.unwrap(), vec![1]);
}

#[tokio::test]
async fn test_silent_slave_times_out() {
    let (client_side, mut slave_side) = tokio::io::duplex(512);
    let mut link = client(client_side);

    let err = link.read_coils(1, 1, 8).await.unwrap_err();
    assert!(matches!(err, ComLinkError::Timeout(_)));

    // The request still reached the wire intact
    let mut sent = [0u8; 8];
    slave_side.read_exact(&mut sent).await.unwrap();
    let crc = calculate_crc16(&sent[..6]).to_le_bytes();
    assert_eq!(&sent[6..], &crc);
}
