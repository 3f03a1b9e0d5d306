//! Fault supervision
//!
//! Each tick the supervisor looks at the retained plant state, tracks for how
//! long every fault condition has been continuously true and decides which
//! recovery sequence to launch. It never touches the bus itself: it returns
//! actions and the engine carries them out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::registers::{INVERTER_IDLE, INVERTER_RUNNING};
use crate::snapshot::PlantState;

/// Tracks how long one condition has been continuously true
#[derive(Debug, Clone)]
pub struct FaultTimer {
    first_seen: Option<Instant>,
    threshold: Duration,
}

impl FaultTimer {
    pub fn new(threshold: Duration) -> Self {
        Self {
            first_seen: None,
            threshold,
        }
    }

    /// Feed this tick's condition; true once it has held strictly longer
    /// than the threshold
    pub fn observe(&mut self, active: bool, now: Instant) -> bool {
        if !active {
            self.first_seen = None;
            return false;
        }
        let first_seen = *self.first_seen.get_or_insert(now);
        now.saturating_duration_since(first_seen) > self.threshold
    }

    pub fn first_seen(&self) -> Option<Instant> {
        self.first_seen
    }

    pub fn is_armed(&self) -> bool {
        self.first_seen.is_some()
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

/// Single-instance guard for one recovery sequence
#[derive(Debug, Clone, Default)]
pub struct RecoveryGuard {
    busy: Arc<AtomicBool>,
}

impl RecoveryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard; `None` while a sequence still holds it
    pub fn try_acquire(&self) -> Option<GuardLease> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardLease {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof of a held guard; dropping it frees the guard
#[derive(Debug)]
pub struct GuardLease {
    busy: Arc<AtomicBool>,
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Why the inverter is being power-cycled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCycleCause {
    /// Inverter offline alarm coil set
    InverterOffline,
    /// Inverter reports a state other than idle or running with current
    InverterStalled,
}

impl PowerCycleCause {
    /// Whether the triggering condition still holds in `state`
    pub fn is_active(self, state: &PlantState) -> bool {
        match self {
            PowerCycleCause::InverterOffline => state.inverter_offline(),
            PowerCycleCause::InverterStalled => inverter_stalled(state),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            PowerCycleCause::InverterOffline => "inverter offline",
            PowerCycleCause::InverterStalled => "inverter stalled",
        }
    }
}

/// Status is neither idle nor running with motor current
pub fn inverter_stalled(state: &PlantState) -> bool {
    let status = state.inverter_status();
    let healthy = status == INVERTER_IDLE
        || (status == INVERTER_RUNNING && state.motor_current() > 0);
    !healthy
}

/// Work the engine must carry out after an evaluation
#[derive(Debug)]
pub enum SupervisorAction {
    PowerCycle {
        cause: PowerCycleCause,
        lease: GuardLease,
    },
    PumpCycle {
        lease: GuardLease,
    },
    /// Pulse the heat pump alarm reset coil
    ResetFlowAlarm,
}

/// Fault thresholds
#[derive(Debug, Clone, Copy)]
pub struct FaultThresholds {
    pub inverter_offline: Duration,
    pub inverter_stall: Duration,
    pub flow_alarm: Duration,
}

impl Default for FaultThresholds {
    fn default() -> Self {
        Self {
            inverter_offline: Duration::from_secs(60),
            inverter_stall: Duration::from_secs(180),
            flow_alarm: Duration::from_secs(60),
        }
    }
}

/// Time-threshold fault state machine
#[derive(Debug)]
pub struct FaultSupervisor {
    offline: FaultTimer,
    stall: FaultTimer,
    flow: FaultTimer,
    power_cycle: RecoveryGuard,
    pump_cycle: RecoveryGuard,
    // Set once a pump-cycle ran for the current flow alarm episode; cleared
    // only when the alarm coil clears.
    flow_recovery_attempted: bool,
}

impl FaultSupervisor {
    pub fn new(thresholds: FaultThresholds) -> Self {
        Self {
            offline: FaultTimer::new(thresholds.inverter_offline),
            stall: FaultTimer::new(thresholds.inverter_stall),
            flow: FaultTimer::new(thresholds.flow_alarm),
            power_cycle: RecoveryGuard::new(),
            pump_cycle: RecoveryGuard::new(),
            flow_recovery_attempted: false,
        }
    }

    /// Evaluate every monitored fault against the retained state
    pub fn evaluate(&mut self, state: &PlantState, now: Instant) -> Vec<SupervisorAction> {
        let mut actions = Vec::new();

        let offline_due = self.offline.observe(state.inverter_offline(), now);
        let stall_due = self.stall.observe(inverter_stalled(state), now);

        let cause = if offline_due {
            Some(PowerCycleCause::InverterOffline)
        } else if stall_due {
            Some(PowerCycleCause::InverterStalled)
        } else {
            None
        };
        if let Some(cause) = cause {
            if let Some(lease) = self.power_cycle.try_acquire() {
                warn!("Fault: {} past threshold, power-cycling inverter", cause.describe());
                actions.push(SupervisorAction::PowerCycle { cause, lease });
            }
        }

        let flow_alarm = state.flow_alarm();
        if !flow_alarm && self.flow_recovery_attempted {
            info!("Flow switch alarm cleared");
            self.flow_recovery_attempted = false;
        }
        if self.flow.observe(flow_alarm, now) {
            if !self.flow_recovery_attempted {
                if let Some(lease) = self.pump_cycle.try_acquire() {
                    warn!("Fault: flow switch alarm past threshold, cycling pumps");
                    self.flow_recovery_attempted = true;
                    actions.push(SupervisorAction::PumpCycle { lease });
                }
            } else if state.flow_switch_closed() {
                info!("Flow restored, resetting heat pump alarm");
                actions.push(SupervisorAction::ResetFlowAlarm);
            }
        }

        actions
    }

    pub fn power_cycle_running(&self) -> bool {
        self.power_cycle.is_held()
    }

    pub fn pump_cycle_running(&self) -> bool {
        self.pump_cycle.is_held()
    }

    pub fn flow_timer(&self) -> &FaultTimer {
        &self.flow
    }

    pub fn offline_timer(&self) -> &FaultTimer {
        &self.offline
    }

    pub fn stall_timer(&self) -> &FaultTimer {
        &self.stall
    }
}
