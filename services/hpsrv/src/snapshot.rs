//! Device register snapshots
//!
//! A `DeviceSnapshot` mirrors the four register regions of one device. The
//! engine keeps one retained snapshot per device for the process lifetime and
//! builds a transient one of the same shape on every poll.

use serde::Serialize;
use tracing::warn;

use crate::error::{HpSrvError, Result};
use crate::registers::{hp_coil, hp_holding, pump_coil, pump_discrete};

/// Identity tag of a snapshot; only snapshots of the same kind compare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceKind {
    #[serde(rename = "hp")]
    HeatPump,
    #[serde(rename = "p")]
    PumpController,
}

impl DeviceKind {
    pub fn tag(self) -> &'static str {
        match self {
            DeviceKind::HeatPump => "hp",
            DeviceKind::PumpController => "p",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DeviceKind::HeatPump => "heat pump",
            DeviceKind::PumpController => "pump controller",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Contiguous register block: base address and length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: u16,
    pub count: u16,
}

impl Region {
    pub const fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn contains(&self, address: u16) -> bool {
        self.index_of(address).is_some()
    }

    /// Snapshot index of a raw address
    pub fn index_of(&self, address: u16) -> Option<usize> {
        let offset = address.checked_sub(self.start)?;
        (offset < self.count).then_some(offset as usize)
    }
}

/// The four regions of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub coils: Region,
    pub discretes: Region,
    pub inputs: Region,
    pub holdings: Region,
}

/// Fixed-shape mirror of one device's register space
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    #[serde(rename = "type")]
    kind: DeviceKind,
    #[serde(rename = "coil")]
    coils: Vec<bool>,
    #[serde(rename = "discrete")]
    discretes: Vec<bool>,
    #[serde(rename = "input")]
    inputs: Vec<u16>,
    #[serde(rename = "holding")]
    holdings: Vec<u16>,
    #[serde(skip)]
    layout: RegionLayout,
    #[serde(skip)]
    slave: u8,
}

impl DeviceSnapshot {
    /// Zero-valued snapshot of the declared shape
    pub fn new(kind: DeviceKind, layout: RegionLayout, slave: u8) -> Self {
        Self {
            kind,
            coils: vec![false; layout.coils.count as usize],
            discretes: vec![false; layout.discretes.count as usize],
            inputs: vec![0; layout.inputs.count as usize],
            holdings: vec![0; layout.holdings.count as usize],
            layout,
            slave,
        }
    }

    /// Snapshot with the physical map of `kind`
    pub fn for_device(kind: DeviceKind, slave: u8) -> Self {
        Self::new(kind, kind.layout(), slave)
    }

    /// Empty snapshot of the same shape and slave
    pub fn blank_like(&self) -> Self {
        Self::new(self.kind, self.layout, self.slave)
    }

    /// Elementwise equality of all four regions.
    ///
    /// Snapshots of different kinds never compare equal; the attempt is
    /// logged and rejected without looking at the registers.
    pub fn compare(&self, other: &DeviceSnapshot) -> bool {
        if self.kind != other.kind {
            warn!(
                "Rejected snapshot comparison between {} and {}",
                self.kind, other.kind
            );
            return false;
        }
        self.discretes == other.discretes
            && self.coils == other.coils
            && self.holdings == other.holdings
            && self.inputs == other.inputs
    }

    /// Copy every register and the slave address from `other`.
    ///
    /// # Panics
    ///
    /// Panics when `other` has a different kind or shape. Nothing is modified
    /// in that case.
    pub fn update(&mut self, other: &DeviceSnapshot) {
        assert!(
            self.kind == other.kind,
            "cannot update a {} snapshot from a {} snapshot",
            self.kind,
            other.kind
        );
        assert!(
            self.layout == other.layout,
            "cannot update a {} snapshot from one with a different register layout",
            self.kind
        );

        self.coils.copy_from_slice(&other.coils);
        self.discretes.copy_from_slice(&other.discretes);
        self.inputs.copy_from_slice(&other.inputs);
        self.holdings.copy_from_slice(&other.holdings);
        self.slave = other.slave;
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    pub fn layout(&self) -> RegionLayout {
        self.layout
    }

    pub fn coil_start(&self) -> u16 {
        self.layout.coils.start
    }

    pub fn discrete_start(&self) -> u16 {
        self.layout.discretes.start
    }

    pub fn input_start(&self) -> u16 {
        self.layout.inputs.start
    }

    pub fn holding_start(&self) -> u16 {
        self.layout.holdings.start
    }

    pub fn coils(&self) -> &[bool] {
        &self.coils
    }

    pub fn discretes(&self) -> &[bool] {
        &self.discretes
    }

    pub fn inputs(&self) -> &[u16] {
        &self.inputs
    }

    pub fn holdings(&self) -> &[u16] {
        &self.holdings
    }

    pub fn coil_at(&self, address: u16) -> Option<bool> {
        let index = self.layout.coils.index_of(address)?;
        self.coils.get(index).copied()
    }

    pub fn discrete_at(&self, address: u16) -> Option<bool> {
        let index = self.layout.discretes.index_of(address)?;
        self.discretes.get(index).copied()
    }

    pub fn input_at(&self, address: u16) -> Option<u16> {
        let index = self.layout.inputs.index_of(address)?;
        self.inputs.get(index).copied()
    }

    pub fn holding_at(&self, address: u16) -> Option<u16> {
        let index = self.layout.holdings.index_of(address)?;
        self.holdings.get(index).copied()
    }

    /// Set one coil by address; false when the address is outside the map
    #[cfg(test)]
    pub(crate) fn set_coil(&mut self, address: u16, value: bool) -> bool {
        match self.layout.coils.index_of(address) {
            Some(index) => {
                self.coils[index] = value;
                true
            },
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_discrete(&mut self, address: u16, value: bool) -> bool {
        match self.layout.discretes.index_of(address) {
            Some(index) => {
                self.discretes[index] = value;
                true
            },
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_input(&mut self, address: u16, value: u16) -> bool {
        match self.layout.inputs.index_of(address) {
            Some(index) => {
                self.inputs[index] = value;
                true
            },
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_holding(&mut self, address: u16, value: u16) -> bool {
        match self.layout.holdings.index_of(address) {
            Some(index) => {
                self.holdings[index] = value;
                true
            },
            None => false,
        }
    }

    /// Fill a freshly polled snapshot; the retained one only changes through
    /// `update`
    pub(crate) fn load_coils(&mut self, values: &[bool]) -> Result<()> {
        load(&mut self.coils, values, "coil")
    }

    pub(crate) fn load_discretes(&mut self, values: &[bool]) -> Result<()> {
        load(&mut self.discretes, values, "discrete")
    }

    pub(crate) fn load_inputs(&mut self, values: &[u16]) -> Result<()> {
        load(&mut self.inputs, values, "input")
    }

    pub(crate) fn load_holdings(&mut self, values: &[u16]) -> Result<()> {
        load(&mut self.holdings, values, "holding")
    }

    /// Addresses of the alarm coils currently set
    pub fn alarm_coils(&self) -> Vec<u16> {
        if self.kind != DeviceKind::HeatPump {
            return Vec::new();
        }
        let start = self.coil_start();
        self.coils
            .iter()
            .enumerate()
            .filter(|(_, set)| **set)
            .map(|(index, _)| start + index as u16)
            .filter(|address| *address > hp_coil::LAST_NON_ALARM)
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| HpSrvError::io(format!("Snapshot serialization failed: {e}")))
    }
}

fn load<T: Copy>(target: &mut [T], values: &[T], region: &str) -> Result<()> {
    if target.len() != values.len() {
        return Err(HpSrvError::validation(format!(
            "{region} read returned {} values, expected {}",
            values.len(),
            target.len()
        )));
    }
    target.copy_from_slice(values);
    Ok(())
}

/// The pair of retained device snapshots
#[derive(Debug, Clone)]
pub struct PlantState {
    heat_pump: DeviceSnapshot,
    pump: DeviceSnapshot,
}

impl PlantState {
    pub fn new(heat_pump_slave: u8, pump_slave: u8) -> Self {
        Self {
            heat_pump: DeviceSnapshot::for_device(DeviceKind::HeatPump, heat_pump_slave),
            pump: DeviceSnapshot::for_device(DeviceKind::PumpController, pump_slave),
        }
    }

    pub fn device(&self, kind: DeviceKind) -> &DeviceSnapshot {
        match kind {
            DeviceKind::HeatPump => &self.heat_pump,
            DeviceKind::PumpController => &self.pump,
        }
    }

    pub fn heat_pump(&self) -> &DeviceSnapshot {
        &self.heat_pump
    }

    pub fn pump(&self) -> &DeviceSnapshot {
        &self.pump
    }

    pub(crate) fn device_mut(&mut self, kind: DeviceKind) -> &mut DeviceSnapshot {
        match kind {
            DeviceKind::HeatPump => &mut self.heat_pump,
            DeviceKind::PumpController => &mut self.pump,
        }
    }

    #[cfg(test)]
    pub(crate) fn heat_pump_mut(&mut self) -> &mut DeviceSnapshot {
        &mut self.heat_pump
    }

    #[cfg(test)]
    pub(crate) fn pump_mut(&mut self) -> &mut DeviceSnapshot {
        &mut self.pump
    }

    // Heat pump readings

    pub fn heat_pump_on(&self) -> bool {
        self.heat_pump.coil_at(hp_coil::BMS_ON_OFF).unwrap_or(false)
    }

    pub fn inverter_offline(&self) -> bool {
        self.heat_pump.coil_at(hp_coil::INVERTER_OFFLINE).unwrap_or(false)
    }

    pub fn flow_alarm(&self) -> bool {
        self.heat_pump
            .coil_at(hp_coil::WATER_FLOW_SWITCH_ALARM)
            .unwrap_or(false)
    }

    pub fn flow_switch_closed(&self) -> bool {
        self.heat_pump.coil_at(hp_coil::WATER_FLOW_SWITCH).unwrap_or(false)
    }

    pub fn main_water_pump_on(&self) -> bool {
        self.heat_pump.coil_at(hp_coil::MAIN_WATER_PUMP).unwrap_or(false)
    }

    pub fn inverter_status(&self) -> u16 {
        self.heat_pump
            .holding_at(hp_holding::INVERTER_STATUS)
            .unwrap_or(0)
    }

    pub fn motor_current(&self) -> u16 {
        self.heat_pump.holding_at(hp_holding::MOTOR_CURRENT).unwrap_or(0)
    }

    // Pump controller readings

    pub fn cold_pump_running(&self) -> bool {
        self.pump.coil_at(pump_coil::COLD_PUMP).unwrap_or(false)
    }

    pub fn reject_pump_running(&self) -> bool {
        self.pump.coil_at(pump_coil::REJECT_PUMP).unwrap_or(false)
    }

    pub fn cold_no_flow(&self) -> bool {
        self.pump
            .discrete_at(pump_discrete::COLD_NO_FLOW)
            .unwrap_or(false)
    }

    pub fn reject_no_flow(&self) -> bool {
        self.pump
            .discrete_at(pump_discrete::REJECT_NO_FLOW)
            .unwrap_or(false)
    }

    /// Either circulation loop reports no flow
    pub fn any_no_flow(&self) -> bool {
        self.cold_no_flow() || self.reject_no_flow()
    }
}
