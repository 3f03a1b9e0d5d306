//! Periodic data log
//!
//! Every few ticks the engine captures a row of key heat pump and pump
//! controller values and hands it to a `DataLogSink`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::Result;
use crate::registers::{hp_coil, pump_input};
use crate::snapshot::DeviceSnapshot;

const LOGGED_COILS: u16 = 13;

/// One logged sample
#[derive(Debug, Clone, PartialEq)]
pub struct DataLogRow {
    pub timestamp: DateTime<Utc>,
    /// All heat pump holding registers
    pub holdings: Vec<u16>,
    pub ground_loop_in: u16,
    pub ground_loop_out: u16,
    /// Heat pump coils 1 to 13
    pub coils: Vec<bool>,
    /// Set alarm coils, as `hpcN`
    pub alarms: Vec<String>,
    pub reject_in: u16,
    pub reject_out: u16,
    pub insolation: u16,
}

impl DataLogRow {
    pub fn capture(heat_pump: &DeviceSnapshot, pump: &DeviceSnapshot) -> Self {
        let input = |address| pump.input_at(address).unwrap_or(0);
        Self {
            timestamp: Utc::now(),
            holdings: heat_pump.holdings().to_vec(),
            ground_loop_in: input(pump_input::GROUND_LOOP_IN_TEMP),
            ground_loop_out: input(pump_input::GROUND_LOOP_OUT_TEMP),
            coils: (hp_coil::WATER_FLOW_SWITCH..=LOGGED_COILS)
                .map(|address| heat_pump.coil_at(address).unwrap_or(false))
                .collect(),
            alarms: heat_pump
                .alarm_coils()
                .into_iter()
                .map(|address| format!("hpc{address}"))
                .collect(),
            reject_in: input(pump_input::REJECT_IN_TEMP),
            reject_out: input(pump_input::REJECT_OUT_TEMP),
            insolation: input(pump_input::INSOLATION),
        }
    }

    pub fn header(holding_count: usize) -> Vec<String> {
        let mut header = vec!["timestamp".to_string()];
        header.extend((1..=holding_count).map(|n| format!("hp_h{n}")));
        header.push("ground_loop_in".to_string());
        header.push("ground_loop_out".to_string());
        header.extend((1..=LOGGED_COILS).map(|n| format!("hp_c{n}")));
        header.push("alarms".to_string());
        header.push("reject_in".to_string());
        header.push("reject_out".to_string());
        header.push("insolation".to_string());
        header
    }

    pub fn to_record(&self) -> Vec<String> {
        let mut record = vec![self.timestamp.to_rfc3339()];
        record.extend(self.holdings.iter().map(u16::to_string));
        record.push(self.ground_loop_in.to_string());
        record.push(self.ground_loop_out.to_string());
        record.extend(self.coils.iter().map(|c| u8::from(*c).to_string()));
        record.push(self.alarms.join(" : "));
        record.push(self.reject_in.to_string());
        record.push(self.reject_out.to_string());
        record.push(self.insolation.to_string());
        record
    }
}

pub trait DataLogSink: Send + Sync {
    fn record(&mut self, row: &DataLogRow) -> Result<()>;
}

/// Appends rows to a CSV file, writing the header for a new file
pub struct CsvDataLog {
    writer: csv::Writer<std::fs::File>,
    path: PathBuf,
    header_written: bool,
}

impl std::fmt::Debug for CsvDataLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvDataLog").field("path", &self.path).finish()
    }
}

impl CsvDataLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let header_written = file.metadata()?.len() > 0;
        info!("Data log: {}", path.display());
        Ok(Self {
            writer: csv::Writer::from_writer(file),
            path,
            header_written,
        })
    }
}

impl DataLogSink for CsvDataLog {
    fn record(&mut self, row: &DataLogRow) -> Result<()> {
        if !self.header_written {
            self.writer.write_record(DataLogRow::header(row.holdings.len()))?;
            self.header_written = true;
        }
        self.writer.write_record(row.to_record())?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::registers::hp_holding;
    use crate::snapshot::DeviceKind;

    fn sample() -> DataLogRow {
        let mut hp = DeviceSnapshot::for_device(DeviceKind::HeatPump, 1);
        let mut pump = DeviceSnapshot::for_device(DeviceKind::PumpController, 10);
        hp.set_holding(hp_holding::WATER_IN_TEMP, 121);
        hp.set_coil(hp_coil::WATER_FLOW_SWITCH, true);
        hp.set_coil(hp_coil::WATER_FLOW_SWITCH_ALARM, true);
        hp.set_coil(hp_coil::INVERTER_OFFLINE, true);
        pump.set_input(pump_input::GROUND_LOOP_OUT_TEMP, 88);
        pump.set_input(pump_input::INSOLATION, 640);
        DataLogRow::capture(&hp, &pump)
    }

    #[test]
    fn test_capture_picks_logged_values() {
        let row = sample();
        assert_eq!(row.holdings.len(), 28);
        assert_eq!(row.holdings[0], 121);
        assert_eq!(row.coils.len(), 13);
        assert!(row.coils[0]);
        assert_eq!(row.ground_loop_out, 88);
        assert_eq!(row.insolation, 640);
        assert_eq!(row.alarms, vec!["hpc53", "hpc138"]);
        assert_eq!(row.to_record().len(), DataLogRow::header(28).len());
    }

    #[test]
    fn test_csv_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("heatpump.csv");

        let mut log = CsvDataLog::open(&path).unwrap();
        log.record(&sample()).unwrap();
        log.record(&sample()).unwrap();
        drop(log);

        // Reopening appends without a second header
        let mut log = CsvDataLog::open(&path).unwrap();
        log.record(&sample()).unwrap();
        drop(log);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "timestamp");
        assert_eq!(&headers[1], "hp_h1");
        assert!(headers.iter().any(|h| h == "alarms"));

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        let alarms = headers.iter().position(|h| h == "alarms").unwrap();
        assert_eq!(&rows[0][alarms], "hpc53 : hpc138");
    }
}
