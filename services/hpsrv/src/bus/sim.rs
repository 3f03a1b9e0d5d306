//! Simulated register bus
//!
//! An in-memory register map per slave. Used by `--simulate` and by tests:
//! the `SimHandle` side can preload registers, inject failures, add latency
//! and inspect the writes the service issued.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use comlink::ComLinkError;
use parking_lot::Mutex;
use tracing::debug;

use super::{BusResult, RegisterBus};
use crate::registers::{hp_coil, pump_coil, pump_discrete, pump_holding};

/// A write observed on the simulated bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimWrite {
    Coil { slave: u8, address: u16, value: bool },
    Holding { slave: u8, address: u16, value: u16 },
}

#[derive(Debug, Default)]
struct SlaveMap {
    coils: BTreeMap<u16, bool>,
    discretes: BTreeMap<u16, bool>,
    inputs: BTreeMap<u16, u16>,
    holdings: BTreeMap<u16, u16>,
}

fn coil_map(map: &SlaveMap) -> &BTreeMap<u16, bool> {
    &map.coils
}

fn discrete_map(map: &SlaveMap) -> &BTreeMap<u16, bool> {
    &map.discretes
}

fn input_map(map: &SlaveMap) -> &BTreeMap<u16, u16> {
    &map.inputs
}

fn holding_map(map: &SlaveMap) -> &BTreeMap<u16, u16> {
    &map.holdings
}

/// Devices whose registers react to commands like the real plant
#[derive(Debug, Clone, Copy)]
struct PlantModel {
    heat_pump: u8,
    pump: u8,
}

#[derive(Debug, Default)]
struct SimState {
    slaves: HashMap<u8, SlaveMap>,
    failing: HashSet<u8>,
    rejected: HashSet<SimWrite>,
    latency: Duration,
    writes: Vec<SimWrite>,
    calls: u64,
    in_flight: usize,
    max_in_flight: usize,
    plant: Option<PlantModel>,
}

impl SimState {
    fn slave(&mut self, slave: u8) -> &mut SlaveMap {
        self.slaves.entry(slave).or_default()
    }

    /// Mirror pump overrides and heat pump commands onto status registers
    fn apply_plant_rules(&mut self, write: SimWrite) {
        let Some(plant) = self.plant else {
            return;
        };
        match write {
            SimWrite::Holding {
                slave,
                address,
                value,
            } if slave == plant.pump => {
                let running = value > pump_holding::ON_THRESHOLD;
                let (coil, no_flow) = match address {
                    pump_holding::COLD_OVERRIDE => {
                        (pump_coil::COLD_PUMP, pump_discrete::COLD_NO_FLOW)
                    },
                    pump_holding::REJECT_OVERRIDE => {
                        (pump_coil::REJECT_PUMP, pump_discrete::REJECT_NO_FLOW)
                    },
                    _ => return,
                };
                let map = self.slave(plant.pump);
                map.coils.insert(coil, running);
                map.discretes.insert(no_flow, !running);
            },
            SimWrite::Coil {
                slave,
                address,
                value,
            } if slave == plant.heat_pump => match address {
                hp_coil::BMS_ON_OFF => {
                    let map = self.slave(plant.heat_pump);
                    map.coils.insert(hp_coil::MAIN_WATER_PUMP, value);
                    map.coils.insert(hp_coil::WATER_FLOW_SWITCH, value);
                },
                hp_coil::ALARM_RESET if value => {
                    let map = self.slave(plant.heat_pump);
                    for address in (hp_coil::LAST_NON_ALARM + 1)..hp_coil::INVERTER_OFFLINE {
                        map.coils.remove(&address);
                    }
                    map.coils.insert(hp_coil::ALARM_RESET, false);
                },
                _ => {},
            },
            _ => {},
        }
    }
}

/// Control side of a `SimulatedBus`
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn set_coil(&self, slave: u8, address: u16, value: bool) {
        self.state.lock().slave(slave).coils.insert(address, value);
    }

    pub fn set_discrete(&self, slave: u8, address: u16, value: bool) {
        self.state.lock().slave(slave).discretes.insert(address, value);
    }

    pub fn set_input(&self, slave: u8, address: u16, value: u16) {
        self.state.lock().slave(slave).inputs.insert(address, value);
    }

    pub fn set_holding(&self, slave: u8, address: u16, value: u16) {
        self.state.lock().slave(slave).holdings.insert(address, value);
    }

    pub fn coil(&self, slave: u8, address: u16) -> Option<bool> {
        self.state
            .lock()
            .slaves
            .get(&slave)
            .and_then(|map| map.coils.get(&address).copied())
    }

    pub fn holding(&self, slave: u8, address: u16) -> Option<u16> {
        self.state
            .lock()
            .slaves
            .get(&slave)
            .and_then(|map| map.holdings.get(&address).copied())
    }

    /// Make every call to `slave` time out
    pub fn fail_slave(&self, slave: u8, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(slave);
        } else {
            state.failing.remove(&slave);
        }
    }

    /// Refuse this exact write instead of applying it
    pub fn reject_write(&self, write: SimWrite) {
        self.state.lock().rejected.insert(write);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Let command writes drive the status registers of both devices
    pub fn enable_plant_model(&self, heat_pump: u8, pump: u8) {
        self.state.lock().plant = Some(PlantModel { heat_pump, pump });
    }

    pub fn writes(&self) -> Vec<SimWrite> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    pub fn call_count(&self) -> u64 {
        self.state.lock().calls
    }

    /// Highest number of calls ever observed in progress at once
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

/// In-memory `RegisterBus`; unset registers read as zero
#[derive(Debug)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new() -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimHandle { state },
        )
    }

    /// Account for one call: latency, overlap tracking and failure injection
    async fn enter(&self, slave: u8) -> BusResult<()> {
        let latency = {
            let mut state = self.state.lock();
            state.calls += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.failing.contains(&slave) {
            debug!("Simulated timeout for slave {}", slave);
            return Err(ComLinkError::timeout(format!(
                "No response from unit {slave}"
            )));
        }
        Ok(())
    }

    fn read_bits(
        &self,
        slave: u8,
        start: u16,
        count: u16,
        region: fn(&SlaveMap) -> &BTreeMap<u16, bool>,
    ) -> Vec<bool> {
        let mut state = self.state.lock();
        let map = region(state.slave(slave));
        (0..count)
            .map(|i| map.get(&start.wrapping_add(i)).copied().unwrap_or(false))
            .collect()
    }

    fn read_words(
        &self,
        slave: u8,
        start: u16,
        count: u16,
        region: fn(&SlaveMap) -> &BTreeMap<u16, u16>,
    ) -> Vec<u16> {
        let mut state = self.state.lock();
        let map = region(state.slave(slave));
        (0..count)
            .map(|i| map.get(&start.wrapping_add(i)).copied().unwrap_or(0))
            .collect()
    }

    fn record(&self, write: SimWrite) -> BusResult<()> {
        let mut state = self.state.lock();
        if state.rejected.contains(&write) {
            debug!("Simulated rejection of {:?}", write);
            return Err(ComLinkError::protocol(format!("Write refused: {write:?}")));
        }
        match write {
            SimWrite::Coil {
                slave,
                address,
                value,
            } => {
                state.slave(slave).coils.insert(address, value);
            },
            SimWrite::Holding {
                slave,
                address,
                value,
            } => {
                state.slave(slave).holdings.insert(address, value);
            },
        }
        state.writes.push(write);
        state.apply_plant_rules(write);
        Ok(())
    }
}

#[async_trait]
impl RegisterBus for SimulatedBus {
    async fn read_coil(&mut self, address: u16, slave: u8) -> BusResult<bool> {
        self.enter(slave).await?;
        Ok(self.read_bits(slave, address, 1, coil_map)[0])
    }

    async fn write_coil(&mut self, address: u16, value: bool, slave: u8) -> BusResult<()> {
        self.enter(slave).await?;
        self.record(SimWrite::Coil {
            slave,
            address,
            value,
        })
    }

    async fn read_holding_register(&mut self, address: u16, slave: u8) -> BusResult<u16> {
        self.enter(slave).await?;
        Ok(self.read_words(slave, address, 1, holding_map)[0])
    }

    async fn write_holding_register(
        &mut self,
        address: u16,
        value: u16,
        slave: u8,
    ) -> BusResult<()> {
        self.enter(slave).await?;
        self.record(SimWrite::Holding {
            slave,
            address,
            value,
        })
    }

    async fn read_coils(&mut self, start: u16, count: u16, slave: u8) -> BusResult<Vec<bool>> {
        self.enter(slave).await?;
        Ok(self.read_bits(slave, start, count, coil_map))
    }

    async fn read_discretes(
        &mut self,
        start: u16,
        count: u16,
        slave: u8,
    ) -> BusResult<Vec<bool>> {
        self.enter(slave).await?;
        Ok(self.read_bits(slave, start, count, discrete_map))
    }

    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
        slave: u8,
    ) -> BusResult<Vec<u16>> {
        self.enter(slave).await?;
        Ok(self.read_words(slave, start, count, holding_map))
    }

    async fn read_input_registers(
        &mut self,
        start: u16,
        count: u16,
        slave: u8,
    ) -> BusResult<Vec<u16>> {
        self.enter(slave).await?;
        Ok(self.read_words(slave, start, count, input_map))
    }
}
