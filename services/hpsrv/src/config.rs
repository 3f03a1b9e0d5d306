//! Service configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `HPSRV_` environment variables (`__` separates nested keys, for example
//! `HPSRV_SERIAL__PORT=/dev/ttyAMA0`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use comlink::SerialSettings;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{HpSrvError, Result};
use crate::fault::FaultThresholds;
use crate::hub::HubConfig;

pub const ENV_PREFIX: &str = "HPSRV_";

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HpSrvConfig {
    pub serial: SerialSettings,
    pub devices: DeviceConfig,
    pub api: ApiConfig,
    pub supervisor: SupervisorConfig,
    pub recovery: RecoveryConfig,
    pub hub: HubSettings,
    pub notify: NotifyConfig,
    pub datalog: DataLogConfig,
    pub logging: LoggingConfig,
}

/// Slave addresses on the shared bus
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub heat_pump_slave: u8,
    pub pump_slave: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            heat_pump_slave: 1,
            pump_slave: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8085".to_string(),
        }
    }
}

/// Tick and fault thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub tick_interval_ms: u64,
    pub inverter_offline_secs: u64,
    pub inverter_stall_secs: u64,
    pub flow_alarm_secs: u64,
    /// Write a data log row every N ticks
    pub datalog_every: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            inverter_offline_secs: 60,
            inverter_stall_secs: 180,
            flow_alarm_secs: 60,
            datalog_every: 5,
        }
    }
}

impl SupervisorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn thresholds(&self) -> FaultThresholds {
        FaultThresholds {
            inverter_offline: Duration::from_secs(self.inverter_offline_secs),
            inverter_stall: Duration::from_secs(self.inverter_stall_secs),
            flow_alarm: Duration::from_secs(self.flow_alarm_secs),
        }
    }
}

/// Recovery sequence timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Contactor hold time with the inverter unpowered
    pub de_energize_secs: u64,
    /// Wait after re-powering before checking the inverter
    pub settle_secs: u64,
    /// Circulators off time during a pump-cycle
    pub pump_pause_secs: u64,
    pub alarm_reset_delay_secs: u64,
    /// Delay before stopping the pumps after the heat pump stopped
    pub pump_stop_delay_secs: u64,
    pub pump_recheck_secs: u64,
    pub start_retry_secs: u64,
    pub start_attempts: u32,
    /// Pause after priming each pump on operator start
    pub prime_pause_secs: u64,
    /// Spacing between pump controller register writes
    pub register_write_spacing_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            de_energize_secs: 120,
            settle_secs: 60,
            pump_pause_secs: 1,
            alarm_reset_delay_secs: 30,
            pump_stop_delay_secs: 15,
            pump_recheck_secs: 5,
            start_retry_secs: 15,
            start_attempts: 10,
            prime_pause_secs: 1,
            register_write_spacing_ms: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn de_energize(&self) -> Duration {
        Duration::from_secs(self.de_energize_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn pump_pause(&self) -> Duration {
        Duration::from_secs(self.pump_pause_secs)
    }

    pub fn alarm_reset_delay(&self) -> Duration {
        Duration::from_secs(self.alarm_reset_delay_secs)
    }

    pub fn pump_stop_delay(&self) -> Duration {
        Duration::from_secs(self.pump_stop_delay_secs)
    }

    pub fn pump_recheck(&self) -> Duration {
        Duration::from_secs(self.pump_recheck_secs)
    }

    pub fn start_retry(&self) -> Duration {
        Duration::from_secs(self.start_retry_secs)
    }

    pub fn prime_pause(&self) -> Duration {
        Duration::from_secs(self.prime_pause_secs)
    }

    pub fn register_write_spacing(&self) -> Duration {
        Duration::from_millis(self.register_write_spacing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubSettings {
    /// Broadcast queue slots before updates are dropped
    pub queue_capacity: usize,
    /// Per-observer buffer for WebSocket sessions
    pub observer_buffer: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            observer_buffer: 16,
        }
    }
}

impl HubSettings {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue_capacity,
            ..HubConfig::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Log-only when absent
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataLogConfig {
    /// Disabled when absent
    pub csv_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: Option<PathBuf>,
    pub json: bool,
}

impl HpSrvConfig {
    /// Load defaults, then `path` if it exists, then the environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut figment = Figment::from(Serialized::defaults(HpSrvConfig::default()));
        if path.exists() {
            figment = figment.merge(Yaml::file(path));
        } else {
            tracing::warn!("Config file {} not found, using defaults", path.display());
        }
        let config: HpSrvConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.serial
            .validate()
            .map_err(|e| HpSrvError::config(format!("serial: {e}")))?;

        if self.devices.heat_pump_slave == self.devices.pump_slave {
            return Err(HpSrvError::config(format!(
                "heat pump and pump controller share slave address {}",
                self.devices.pump_slave
            )));
        }
        if self.devices.heat_pump_slave == 0 || self.devices.pump_slave == 0 {
            return Err(HpSrvError::config("slave address 0 is the broadcast address"));
        }
        if self.api.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(HpSrvError::config(format!(
                "invalid api.bind_address: {}",
                self.api.bind_address
            )));
        }

        let s = &self.supervisor;
        if s.tick_interval_ms == 0 || s.datalog_every == 0 {
            return Err(HpSrvError::config(
                "supervisor intervals must be greater than zero",
            ));
        }
        if self.recovery.start_attempts == 0 {
            return Err(HpSrvError::config("recovery.start_attempts must be at least 1"));
        }
        if self.recovery.pump_recheck_secs == 0 {
            return Err(HpSrvError::config("recovery.pump_recheck_secs must be greater than zero"));
        }
        if self.hub.queue_capacity == 0 || self.hub.observer_buffer == 0 {
            return Err(HpSrvError::config("hub capacities must be greater than zero"));
        }
        Ok(())
    }

    /// Effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use comlink::Parity;

    #[test]
    fn test_defaults() {
        let config = HpSrvConfig::default();
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 19_200);
        assert_eq!(config.serial.stop_bits, 2);
        assert_eq!(config.serial.parity, Parity::None);
        assert_eq!(config.devices.heat_pump_slave, 1);
        assert_eq!(config.devices.pump_slave, 10);
        assert_eq!(config.api.bind_address, "0.0.0.0:8085");
        assert_eq!(config.supervisor.thresholds().inverter_stall, Duration::from_secs(180));
        assert_eq!(config.recovery.de_energize(), Duration::from_secs(120));
        assert_eq!(config.hub.queue_capacity, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_and_env_layers() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "hpsrv.yaml",
                r#"
serial:
  port: /dev/ttyAMA0
  parity: E
devices:
  pump_slave: 11
supervisor:
  flow_alarm_secs: 90
"#,
            )?;
            jail.set_env("HPSRV_SERIAL__BAUD_RATE", "9600");
            jail.set_env("HPSRV_NOTIFY__WEBHOOK_URL", "http://localhost:9000/hook");

            let config = HpSrvConfig::load("hpsrv.yaml").map_err(|e| e.to_string())?;
            assert_eq!(config.serial.port, "/dev/ttyAMA0");
            assert_eq!(config.serial.parity, Parity::Even);
            assert_eq!(config.serial.baud_rate, 9600);
            assert_eq!(config.serial.stop_bits, 2);
            assert_eq!(config.devices.pump_slave, 11);
            assert_eq!(config.devices.heat_pump_slave, 1);
            assert_eq!(config.supervisor.flow_alarm_secs, 90);
            assert_eq!(
                config.notify.webhook_url.as_deref(),
                Some("http://localhost:9000/hook")
            );
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = HpSrvConfig::load("absent.yaml").map_err(|e| e.to_string())?;
            assert_eq!(config, HpSrvConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = HpSrvConfig::default();
        config.devices.pump_slave = 1;
        assert!(config.validate().is_err());

        let mut config = HpSrvConfig::default();
        config.serial.data_bits = 9;
        assert!(config.validate().is_err());

        let mut config = HpSrvConfig::default();
        config.recovery.start_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = HpSrvConfig::default();
        config.hub.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_output_round_trips() {
        let yaml = HpSrvConfig::default().to_yaml().unwrap();
        assert!(yaml.contains("bind_address"));
        let parsed: HpSrvConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, HpSrvConfig::default());
    }
}
