//! Recovery sequences
//!
//! Long-running corrective actions launched by the fault supervisor. Each
//! runs on its own task while holding the supervisor's guard lease, so at
//! most one instance of a sequence exists at a time.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::fault::{GuardLease, PowerCycleCause};
use crate::notify::{Notification, Notifier};
use crate::plant::PlantControl;

/// A sequence the supervisor asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryJob {
    PowerCycle(PowerCycleCause),
    PumpCycle,
}

/// Launches recovery jobs; the lease must be dropped once the job no longer
/// needs exclusivity
pub trait RecoveryRunner: Send + Sync {
    fn launch(&self, job: RecoveryJob, lease: GuardLease);
}

/// Spawns every job as a tokio task
#[derive(Debug, Clone)]
pub struct TaskRunner {
    plant: PlantControl,
    notifier: Arc<dyn Notifier>,
}

impl TaskRunner {
    pub fn new(plant: PlantControl, notifier: Arc<dyn Notifier>) -> Self {
        Self { plant, notifier }
    }
}

impl RecoveryRunner for TaskRunner {
    fn launch(&self, job: RecoveryJob, lease: GuardLease) {
        let plant = self.plant.clone();
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            match job {
                RecoveryJob::PowerCycle(cause) => {
                    power_cycle(&plant, notifier.as_ref(), cause).await;
                    drop(lease);
                },
                RecoveryJob::PumpCycle => pump_cycle(&plant, lease).await,
            }
        });
    }
}

/// Cut and restore the inverter supply, then restart the heat pump.
///
/// Returns whether the triggering condition had cleared after the settle
/// time.
pub async fn power_cycle(
    plant: &PlantControl,
    notifier: &dyn Notifier,
    cause: PowerCycleCause,
) -> bool {
    let timing = plant.timing().clone();
    warn!("Power-cycling heat pump inverter ({})", cause.describe());

    if let Err(e) = plant.set_isolation(true).await {
        error!("Isolation contactor not energized: {}", e);
    }
    if let Err(e) = plant.orderly_stop().await {
        error!("Orderly stop failed: {}", e);
    }

    sleep(timing.de_energize()).await;

    if let Err(e) = plant.set_isolation(false).await {
        error!("Isolation contactor not released: {}", e);
    }
    info!("Inverter re-powered, settling");
    sleep(timing.settle()).await;

    let recovered = !cause.is_active(&plant.state());
    let notification = if recovered {
        Notification::new(
            "Heat Pump Inverter Power Cycled",
            format!("The heat pump inverter was power cycled after {}.", cause.describe()),
        )
    } else {
        Notification::new(
            "Heat Pump Failure",
            format!(
                "The heat pump inverter was power cycled after {} but the fault persists.",
                cause.describe()
            ),
        )
    };
    if let Err(e) = notifier.notify(&notification).await {
        error!("Notification failed: {}", e);
    }

    plant.start_heat_pump().await;
    info!("Power-cycle finished");
    recovered
}

/// Stop both circulators briefly, restart them and reset the flow alarm
/// later.
///
/// The lease is released as soon as the circulators are commanded back on;
/// the alarm reset runs on its own task.
pub async fn pump_cycle(plant: &PlantControl, lease: GuardLease) {
    let timing = plant.timing().clone();
    warn!("Cycling circulators to clear flow switch alarm");

    if let Err(e) = plant.set_circulators(false).await {
        error!("Circulators not stopped: {}", e);
    }
    sleep(timing.pump_pause()).await;
    if let Err(e) = plant.set_circulators(true).await {
        error!("Circulators not restarted: {}", e);
    }
    drop(lease);

    let plant = plant.clone();
    tokio::spawn(async move {
        sleep(timing.alarm_reset_delay()).await;
        match plant.reset_alarm().await {
            Ok(()) => info!("Heat pump alarm reset after pump-cycle"),
            Err(e) => error!("Alarm reset failed: {}", e),
        }
    });
}
