//! Register map of the heat pump and the pump controller
//!
//! Addresses are raw protocol addresses. Every region starts at 1, so the
//! snapshot index of an address is `address - 1`.

use crate::snapshot::{DeviceKind, Region, RegionLayout};

/// Heat pump coils
pub mod hp_coil {
    pub const WATER_FLOW_SWITCH: u16 = 1;
    pub const MAIN_WATER_PUMP: u16 = 7;
    pub const ALARM_RESET: u16 = 16;
    /// Building management on/off, the heat pump run command
    pub const BMS_ON_OFF: u16 = 17;
    pub const WATER_FLOW_SWITCH_ALARM: u16 = 53;
    pub const INVERTER_OFFLINE: u16 = 138;

    /// Every coil above this address is an alarm flag
    pub const LAST_NON_ALARM: u16 = 17;
}

/// Heat pump holding registers
pub mod hp_holding {
    /// Water in temperature, 0.1 °C
    pub const WATER_IN_TEMP: u16 = 1;
    /// Water out temperature, 0.1 °C
    pub const WATER_OUT_TEMP: u16 = 2;
    /// Cooling setpoint, 0.1 °C
    pub const COOLING_SETPOINT: u16 = 13;
    pub const COMPRESSOR_SPEED: u16 = 23;
    /// 0 idle, 1 running, anything else is a fault state
    pub const INVERTER_STATUS: u16 = 24;
    /// Motor current, 0.1 A
    pub const MOTOR_CURRENT: u16 = 25;
    pub const MOTOR_VOLTAGE: u16 = 26;
}

/// Pump controller coils
pub mod pump_coil {
    pub const COLD_PUMP: u16 = 2;
    pub const REJECT_PUMP: u16 = 3;
    /// Isolates the heat pump inverter supply when energized
    pub const INVERTER_CONTACTOR: u16 = 4;
}

/// Pump controller discrete inputs, set when the loop shows NO flow
pub mod pump_discrete {
    pub const COLD_NO_FLOW: u16 = 2;
    pub const REJECT_NO_FLOW: u16 = 3;
}

/// Pump controller holding registers
pub mod pump_holding {
    pub const COLD_OVERRIDE: u16 = 3;
    pub const REJECT_OVERRIDE: u16 = 4;

    /// Override values above this mean the pump is commanded on
    pub const ON_THRESHOLD: u16 = 99;
    pub const OVERRIDE_ON: u16 = 100;
    pub const OVERRIDE_OFF: u16 = 0;
}

/// Pump controller input registers kept in the data log
pub mod pump_input {
    pub const REJECT_IN_TEMP: u16 = 4;
    pub const REJECT_OUT_TEMP: u16 = 5;
    pub const INSOLATION: u16 = 8;
    pub const GROUND_LOOP_IN_TEMP: u16 = 12;
    pub const GROUND_LOOP_OUT_TEMP: u16 = 13;
}

/// Inverter status value while the compressor is driven
pub const INVERTER_RUNNING: u16 = 1;
pub const INVERTER_IDLE: u16 = 0;

impl DeviceKind {
    /// Physical register map of the device
    pub fn layout(self) -> RegionLayout {
        match self {
            DeviceKind::HeatPump => RegionLayout {
                coils: Region::new(1, 138),
                discretes: Region::new(1, 0),
                inputs: Region::new(1, 0),
                holdings: Region::new(1, 28),
            },
            DeviceKind::PumpController => RegionLayout {
                coils: Region::new(1, 8),
                discretes: Region::new(1, 4),
                inputs: Region::new(1, 16),
                holdings: Region::new(1, 6),
            },
        }
    }
}

/// Parse an operator register key such as `hpc17` or `ph3`
///
/// `prefix_hp` and `prefix_pump` select the register family; the remainder
/// must be a decimal address.
pub fn parse_register_key(key: &str, prefix_hp: &str, prefix_pump: &str) -> Option<(DeviceKind, u16)> {
    let (kind, rest) = if let Some(rest) = key.strip_prefix(prefix_hp) {
        (DeviceKind::HeatPump, rest)
    } else if let Some(rest) = key.strip_prefix(prefix_pump) {
        (DeviceKind::PumpController, rest)
    } else {
        return None;
    };
    rest.parse::<u16>().ok().map(|address| (kind, address))
}
