//! Supervisor engine
//!
//! Owns the retained plant state and drives everything that happens once per
//! tick: poll both devices, publish changes, enforce the flow interlock, log
//! data and evaluate faults. Ticks and forced refreshes run on the same task,
//! so they never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::BusGate;
use crate::config::HpSrvConfig;
use crate::datalog::{DataLogRow, DataLogSink};
use crate::error::{HpSrvError, Result};
use crate::fault::{FaultSupervisor, SupervisorAction};
use crate::hub::HubHandle;
use crate::notify::Notifier;
use crate::plant::PlantControl;
use crate::poll::{poll_device, PollOutcome};
use crate::recovery::{RecoveryJob, RecoveryRunner, TaskRunner};
use crate::snapshot::{DeviceKind, PlantState};

const COMMAND_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    /// Publish both snapshots even if unchanged
    Refresh,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub pump: PollOutcome,
    pub heat_pump: PollOutcome,
    pub interlock_tripped: bool,
    pub logged: bool,
    pub launched: Vec<RecoveryJob>,
    pub alarm_reset: bool,
}

pub struct Engine {
    plant_state: PlantState,
    state_tx: watch::Sender<PlantState>,
    gate: BusGate,
    supervisor: FaultSupervisor,
    hub: HubHandle,
    runner: Arc<dyn RecoveryRunner>,
    plant: PlantControl,
    datalog: Option<Box<dyn DataLogSink>>,
    datalog_every: u32,
    tick_count: u64,
    tick_interval: Duration,
    commands: mpsc::Receiver<EngineCommand>,
    commands_open: bool,
}

/// Cloneable access to a running engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    state: watch::Receiver<PlantState>,
}

impl EngineHandle {
    /// Ask for a forced publish of both snapshots
    pub fn request_refresh(&self) -> Result<()> {
        match self.commands.try_send(EngineCommand::Refresh) {
            Ok(()) => Ok(()),
            // A queued refresh covers this request too
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(HpSrvError::hub("engine is not running"))
            },
        }
    }

    pub fn state(&self) -> PlantState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlantState> {
        self.state.clone()
    }
}

impl Engine {
    pub fn new(
        config: &HpSrvConfig,
        gate: BusGate,
        hub: HubHandle,
        notifier: Arc<dyn Notifier>,
    ) -> (Self, EngineHandle) {
        let plant_state = PlantState::new(config.devices.heat_pump_slave, config.devices.pump_slave);
        let (state_tx, state_rx) = watch::channel(plant_state.clone());
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);

        let plant = PlantControl::new(
            gate.clone(),
            state_rx.clone(),
            config.devices.heat_pump_slave,
            config.devices.pump_slave,
            config.recovery.clone(),
        );
        let runner = Arc::new(TaskRunner::new(plant.clone(), notifier));

        let engine = Self {
            plant_state,
            state_tx,
            gate,
            supervisor: FaultSupervisor::new(config.supervisor.thresholds()),
            hub,
            runner,
            plant,
            datalog: None,
            datalog_every: config.supervisor.datalog_every.max(1),
            tick_count: 0,
            tick_interval: config.supervisor.tick_interval(),
            commands,
            commands_open: true,
        };
        let handle = EngineHandle {
            commands: command_tx,
            state: state_rx,
        };
        (engine, handle)
    }

    pub fn with_datalog(mut self, sink: Box<dyn DataLogSink>) -> Self {
        self.datalog = Some(sink);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn RecoveryRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Plant operations bound to this engine's bus and state
    pub fn plant(&self) -> PlantControl {
        self.plant.clone()
    }

    pub fn state(&self) -> &PlantState {
        &self.plant_state
    }

    pub fn supervisor(&self) -> &FaultSupervisor {
        &self.supervisor
    }

    /// Tick forever, serving refresh requests between ticks
    pub async fn run(mut self) {
        info!(
            "Supervisor engine started (tick {} ms)",
            self.tick_interval.as_millis()
        );
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Instant::now()).await;
                },
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(EngineCommand::Refresh) => self.refresh().await,
                    None => {
                        debug!("Engine command channel closed");
                        self.commands_open = false;
                    },
                },
            }
        }
    }

    /// One full supervisory pass
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let (pump, heat_pump) = self.poll(false).await;
        let interlock_tripped = self.flow_interlock().await;

        self.tick_count += 1;
        let logged = self.tick_count % u64::from(self.datalog_every) == 0 && self.log_data();

        let mut launched = Vec::new();
        let mut alarm_reset = false;
        for action in self.supervisor.evaluate(&self.plant_state, now) {
            match action {
                SupervisorAction::PowerCycle { cause, lease } => {
                    let job = RecoveryJob::PowerCycle(cause);
                    self.runner.launch(job, lease);
                    launched.push(job);
                },
                SupervisorAction::PumpCycle { lease } => {
                    self.runner.launch(RecoveryJob::PumpCycle, lease);
                    launched.push(RecoveryJob::PumpCycle);
                },
                SupervisorAction::ResetFlowAlarm => match self.plant.reset_alarm().await {
                    Ok(()) => alarm_reset = true,
                    Err(e) => error!("Flow alarm reset failed: {}", e),
                },
            }
        }

        TickReport {
            pump,
            heat_pump,
            interlock_tripped,
            logged,
            launched,
            alarm_reset,
        }
    }

    /// Forced publish of both devices
    pub async fn refresh(&mut self) {
        debug!("Refresh requested");
        self.poll(true).await;
    }

    async fn poll(&mut self, force: bool) -> (PollOutcome, PollOutcome) {
        let pump = poll_device(
            &self.gate,
            self.plant_state.device_mut(DeviceKind::PumpController),
            force,
            &self.hub,
        )
        .await;
        let heat_pump = poll_device(
            &self.gate,
            self.plant_state.device_mut(DeviceKind::HeatPump),
            force,
            &self.hub,
        )
        .await;

        if pump.changed() || heat_pump.changed() {
            self.state_tx.send_replace(self.plant_state.clone());
        }
        for outcome in [pump, heat_pump] {
            if outcome == (PollOutcome::Published { accepted: false }) {
                debug!("Update dropped, {} dropped so far", self.hub.dropped_count());
            }
        }
        (pump, heat_pump)
    }

    /// Keep the heat pump off while either loop reports no flow
    async fn flow_interlock(&self) -> bool {
        if !self.plant_state.any_no_flow() {
            return false;
        }
        let must_stop = match self.plant.disposition().await {
            Ok(disposition) => disposition.heat_pump_on,
            Err(e) => {
                warn!("Disposition unavailable during no-flow: {}", e);
                true
            },
        };
        if !must_stop {
            return false;
        }
        warn!("No flow on a water loop, stopping heat pump");
        if let Err(e) = self.plant.heat_pump_off().await {
            error!("Interlock stop failed: {}", e);
        }
        true
    }

    fn log_data(&mut self) -> bool {
        let Some(sink) = self.datalog.as_mut() else {
            return false;
        };
        let row = DataLogRow::capture(self.plant_state.heat_pump(), self.plant_state.pump());
        match sink.record(&row) {
            Ok(()) => true,
            Err(e) => {
                error!("Data log write failed: {}", e);
                false
            },
        }
    }
}
