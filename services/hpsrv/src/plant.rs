//! Plant operations
//!
//! Named operations on the heat pump and pump controller, shared by the
//! recovery sequences and the HTTP surface. Every bus access goes through the
//! `BusGate`; decisions that depend on the latest poll read the retained
//! state from the engine's `watch` channel.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::bus::BusGate;
use crate::config::RecoveryConfig;
use crate::error::{HpSrvError, Result};
use crate::registers::{hp_coil, hp_holding, pump_coil, pump_holding};
use crate::snapshot::{DeviceKind, PlantState};

/// Which parts of the plant are commanded on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposition {
    pub reject_pump_on: bool,
    pub cold_pump_on: bool,
    pub heat_pump_on: bool,
}

impl Disposition {
    pub fn any_pump_on(&self) -> bool {
        self.reject_pump_on || self.cold_pump_on
    }
}

/// Outcome of an operator start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning,
    Starting,
}

#[derive(Debug, Clone)]
pub struct PlantControl {
    gate: BusGate,
    state: watch::Receiver<PlantState>,
    heat_pump_slave: u8,
    pump_slave: u8,
    timing: RecoveryConfig,
}

impl PlantControl {
    pub fn new(
        gate: BusGate,
        state: watch::Receiver<PlantState>,
        heat_pump_slave: u8,
        pump_slave: u8,
        timing: RecoveryConfig,
    ) -> Self {
        Self {
            gate,
            state,
            heat_pump_slave,
            pump_slave,
            timing,
        }
    }

    /// Latest retained snapshots
    pub fn state(&self) -> PlantState {
        self.state.borrow().clone()
    }

    pub fn timing(&self) -> &RecoveryConfig {
        &self.timing
    }

    pub fn gate(&self) -> &BusGate {
        &self.gate
    }

    pub fn slave(&self, kind: DeviceKind) -> u8 {
        match kind {
            DeviceKind::HeatPump => self.heat_pump_slave,
            DeviceKind::PumpController => self.pump_slave,
        }
    }

    /// Read the pump overrides and the heat pump run command from the bus
    pub async fn disposition(&self) -> Result<Disposition> {
        let reject = self
            .gate
            .read_holding_register(pump_holding::REJECT_OVERRIDE, self.pump_slave)
            .await?;
        let cold = self
            .gate
            .read_holding_register(pump_holding::COLD_OVERRIDE, self.pump_slave)
            .await?;
        let heat_pump_on = self
            .gate
            .read_coil(hp_coil::BMS_ON_OFF, self.heat_pump_slave)
            .await?;
        Ok(Disposition {
            reject_pump_on: reject > pump_holding::ON_THRESHOLD,
            cold_pump_on: cold > pump_holding::ON_THRESHOLD,
            heat_pump_on,
        })
    }

    pub async fn heat_pump_off(&self) -> Result<()> {
        self.gate
            .write_coil(hp_coil::BMS_ON_OFF, false, self.heat_pump_slave)
            .await?;
        Ok(())
    }

    /// Switch the heat pump off, then stop the pumps once it is safe.
    ///
    /// Blocks for the whole pump stop, which never gives up. A failed heat
    /// pump write does not skip the pump stop; that waits for the main water
    /// pump anyway.
    pub async fn orderly_stop(&self) -> Result<()> {
        let disposition = self.disposition().await?;
        if disposition.heat_pump_on {
            info!("Stopping heat pump");
            if let Err(e) = self.heat_pump_off().await {
                error!("Heat pump not switched off: {}", e);
            }
        }
        if disposition.any_pump_on() {
            self.stop_pumps_when_safe(self.timing.pump_stop_delay()).await;
        }
        Ok(())
    }

    /// After `delay`, zero both pump overrides until both pumps report off.
    ///
    /// Overrides are only written while the heat pump's main water pump is
    /// off; the loop rechecks the retained state until the pumps stop.
    pub async fn stop_pumps_when_safe(&self, delay: Duration) {
        sleep(delay).await;

        loop {
            let state = self.state();
            if !state.cold_pump_running() && !state.reject_pump_running() {
                info!("Pumps are not active");
                return;
            }
            if !state.main_water_pump_on() {
                info!("Stopping pumps");
                for address in [pump_holding::REJECT_OVERRIDE, pump_holding::COLD_OVERRIDE] {
                    if let Err(e) = self
                        .gate
                        .write_holding_register(address, pump_holding::OVERRIDE_OFF, self.pump_slave)
                        .await
                    {
                        error!("Pump override {} not cleared: {}", address, e);
                    }
                }
            }
            sleep(self.timing.pump_recheck()).await;
        }
    }

    /// Switch the heat pump on once both loops show flow.
    ///
    /// Returns false when every attempt was used up.
    pub async fn start_heat_pump(&self) -> bool {
        for attempt in 1..=self.timing.start_attempts {
            if self.state().any_no_flow() {
                info!("Waiting for circulation before starting heat pump ({})", attempt);
                sleep(self.timing.start_retry()).await;
                continue;
            }
            match self
                .gate
                .write_coil(hp_coil::BMS_ON_OFF, true, self.heat_pump_slave)
                .await
            {
                Ok(()) => {
                    info!("Heat pump started");
                    return true;
                },
                Err(e) => error!("Heat pump start attempt {} failed: {}", attempt, e),
            }
        }
        warn!("Timed out waiting for the pumps to start up. Heat pump was not started");
        false
    }

    /// Operator start: prime the pumps that are off, then start the heat
    /// pump in the background
    pub async fn command_start(&self) -> Result<StartOutcome> {
        let disposition = self.disposition().await?;
        if disposition.heat_pump_on {
            return Ok(StartOutcome::AlreadyRunning);
        }

        if !disposition.reject_pump_on {
            self.gate
                .write_holding_register(
                    pump_holding::REJECT_OVERRIDE,
                    pump_holding::OVERRIDE_ON,
                    self.pump_slave,
                )
                .await?;
            sleep(self.timing.prime_pause()).await;
        }
        if !disposition.cold_pump_on {
            self.gate
                .write_holding_register(
                    pump_holding::COLD_OVERRIDE,
                    pump_holding::OVERRIDE_ON,
                    self.pump_slave,
                )
                .await?;
            sleep(self.timing.prime_pause()).await;
        }

        let plant = self.clone();
        tokio::spawn(async move {
            plant.start_heat_pump().await;
        });
        Ok(StartOutcome::Starting)
    }

    /// Operator stop: heat pump off now, pumps after the stop delay in the
    /// background
    pub async fn command_stop(&self) -> Result<()> {
        let disposition = self.disposition().await?;
        if disposition.heat_pump_on {
            self.heat_pump_off().await?;
        }
        if disposition.any_pump_on() {
            let plant = self.clone();
            let delay = self.timing.pump_stop_delay();
            tokio::spawn(async move {
                plant.stop_pumps_when_safe(delay).await;
            });
        }
        Ok(())
    }

    pub async fn reset_alarm(&self) -> Result<()> {
        self.gate
            .write_coil(hp_coil::ALARM_RESET, true, self.heat_pump_slave)
            .await?;
        Ok(())
    }

    /// Energize (true) or release the inverter isolation contactor
    pub async fn set_isolation(&self, energized: bool) -> Result<()> {
        self.gate
            .write_coil(pump_coil::INVERTER_CONTACTOR, energized, self.pump_slave)
            .await?;
        Ok(())
    }

    /// Switch both circulators; both writes are attempted
    pub async fn set_circulators(&self, on: bool) -> Result<()> {
        let cold = self
            .gate
            .write_coil(pump_coil::COLD_PUMP, on, self.pump_slave)
            .await;
        let reject = self
            .gate
            .write_coil(pump_coil::REJECT_PUMP, on, self.pump_slave)
            .await;
        cold?;
        reject?;
        Ok(())
    }

    /// Write the cooling setpoint in °C; returns the raw register value
    pub async fn set_cooling_setpoint(&self, celsius: f64) -> Result<u16> {
        let raw = celsius * 10.0;
        if !raw.is_finite() || !(0.0..=f64::from(u16::MAX)).contains(&raw) {
            return Err(HpSrvError::validation(format!(
                "setpoint {celsius} is out of range"
            )));
        }
        let raw = raw.round() as u16;
        self.gate
            .write_holding_register(hp_holding::COOLING_SETPOINT, raw, self.heat_pump_slave)
            .await?;
        Ok(raw)
    }

    /// Invert one coil without letting another caller in between the read
    /// and the write; returns the new value
    pub async fn toggle_coil(&self, kind: DeviceKind, address: u16) -> Result<bool> {
        if !kind.layout().coils.contains(address) {
            return Err(HpSrvError::validation(format!(
                "{kind} has no coil {address}"
            )));
        }
        let slave = self.slave(kind);
        let mut bus = self.gate.session().await;
        let current = bus.read_coil(address, slave).await?;
        bus.write_coil(address, !current, slave).await?;
        info!("{} coil {} set to {}", kind, address, !current);
        Ok(!current)
    }

    pub async fn write_holding(&self, kind: DeviceKind, address: u16, value: u16) -> Result<()> {
        if !kind.layout().holdings.contains(address) {
            return Err(HpSrvError::validation(format!(
                "{kind} has no holding register {address}"
            )));
        }
        self.gate
            .write_holding_register(address, value, self.slave(kind))
            .await?;
        info!("{} holding {} set to {}", kind, address, value);
        Ok(())
    }
}
