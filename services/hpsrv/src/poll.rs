//! Poll cycle: read, diff, publish
//!
//! Each tick reads a fresh copy of a device's registers into a transient
//! snapshot shaped like the retained one. The retained snapshot only changes
//! when the whole read succeeded and either the data differs or a refresh
//! was forced.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::bus::BusGate;
use crate::error::Result;
use crate::hub::{Offer, Publisher};
use crate::snapshot::DeviceSnapshot;

/// What one device poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A bus read failed; the retained snapshot is untouched
    Failed,
    Unchanged,
    /// The retained snapshot was updated and offered to the hub
    Published { accepted: bool },
}

impl PollOutcome {
    pub fn changed(self) -> bool {
        matches!(self, PollOutcome::Published { .. })
    }
}

/// Read every non-empty region of the device described by `template`.
///
/// Order is discretes, coils, holdings, inputs; the first failure aborts.
pub async fn read_device(gate: &BusGate, template: &DeviceSnapshot) -> Result<DeviceSnapshot> {
    let mut fresh = template.blank_like();
    let layout = template.layout();
    let slave = template.slave();

    if !layout.discretes.is_empty() {
        let values = gate
            .read_discretes(layout.discretes.start, layout.discretes.count, slave)
            .await?;
        fresh.load_discretes(&values)?;
    }
    if !layout.coils.is_empty() {
        let values = gate
            .read_coils(layout.coils.start, layout.coils.count, slave)
            .await?;
        fresh.load_coils(&values)?;
    }
    if !layout.holdings.is_empty() {
        let values = gate
            .read_holding_registers(layout.holdings.start, layout.holdings.count, slave)
            .await?;
        fresh.load_holdings(&values)?;
    }
    if !layout.inputs.is_empty() {
        let values = gate
            .read_input_registers(layout.inputs.start, layout.inputs.count, slave)
            .await?;
        fresh.load_inputs(&values)?;
    }

    Ok(fresh)
}

/// Poll one device and publish when it changed or `force` is set
pub async fn poll_device(
    gate: &BusGate,
    retained: &mut DeviceSnapshot,
    force: bool,
    publisher: &dyn Publisher,
) -> PollOutcome {
    let fresh = match read_device(gate, retained).await {
        Ok(fresh) => fresh,
        Err(e) => {
            error!(
                "Poll {} (slave {}) failed: {}",
                retained.kind(),
                retained.slave(),
                e
            );
            return PollOutcome::Failed;
        },
    };

    if !force && fresh.compare(retained) {
        return PollOutcome::Unchanged;
    }

    if force {
        debug!("Forced refresh of {}", retained.kind());
    }
    retained.update(&fresh);

    let payload = match retained.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("{} snapshot not published: {}", retained.kind(), e);
            return PollOutcome::Published { accepted: false };
        },
    };

    let accepted = publisher.publish(Arc::from(payload)) == Offer::Accepted;
    PollOutcome::Published { accepted }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::SimulatedBus;
    use crate::hub::Payload;
    use crate::registers::{hp_coil, hp_holding, pump_discrete};
    use crate::snapshot::DeviceKind;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture {
        payloads: Mutex<Vec<Payload>>,
    }

    impl Publisher for Capture {
        fn publish(&self, payload: Payload) -> Offer {
            self.payloads.lock().push(payload);
            Offer::Accepted
        }
    }

    fn setup() -> (BusGate, crate::bus::SimHandle, Capture) {
        let (bus, handle) = SimulatedBus::new();
        (BusGate::new(Box::new(bus)), handle, Capture::default())
    }

    #[tokio::test]
    async fn test_forced_refresh_publishes_equal_data() {
        let (gate, _handle, capture) = setup();
        let mut retained = DeviceSnapshot::for_device(DeviceKind::HeatPump, 1);

        let outcome = poll_device(&gate, &mut retained, true, &capture).await;
        assert_eq!(outcome, PollOutcome::Published { accepted: true });
        assert_eq!(capture.payloads.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_tick_publishes_nothing() {
        let (gate, _handle, capture) = setup();
        let mut retained = DeviceSnapshot::for_device(DeviceKind::PumpController, 10);

        let outcome = poll_device(&gate, &mut retained, false, &capture).await;
        assert_eq!(outcome, PollOutcome::Unchanged);
        assert!(capture.payloads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_single_change_publishes_once() {
        let (gate, handle, capture) = setup();
        let mut retained = DeviceSnapshot::for_device(DeviceKind::HeatPump, 1);
        handle.set_holding(1, hp_holding::WATER_OUT_TEMP, 97);

        assert!(poll_device(&gate, &mut retained, false, &capture)
            .await
            .changed());
        assert_eq!(
            poll_device(&gate, &mut retained, false, &capture).await,
            PollOutcome::Unchanged
        );

        assert_eq!(retained.holding_at(hp_holding::WATER_OUT_TEMP), Some(97));
        let payloads = capture.payloads.lock();
        assert_eq!(payloads.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(value["type"], "hp");
        assert_eq!(value["holding"][1], 97);
    }

    #[tokio::test]
    async fn test_bus_failure_leaves_retained_untouched() {
        let (gate, handle, capture) = setup();
        let mut retained = DeviceSnapshot::for_device(DeviceKind::PumpController, 10);
        retained.set_discrete(pump_discrete::COLD_NO_FLOW, true);
        let before = retained.clone();

        handle.fail_slave(10, true);
        let outcome = poll_device(&gate, &mut retained, true, &capture).await;

        assert_eq!(outcome, PollOutcome::Failed);
        assert!(retained.compare(&before));
        assert!(capture.payloads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_heat_pump_skips_empty_regions() {
        let (gate, handle, capture) = setup();
        handle.set_coil(1, hp_coil::INVERTER_OFFLINE, true);
        let mut retained = DeviceSnapshot::for_device(DeviceKind::HeatPump, 1);

        poll_device(&gate, &mut retained, false, &capture).await;
        assert_eq!(retained.coil_at(hp_coil::INVERTER_OFFLINE), Some(true));
        // coils and holdings only
        assert_eq!(handle.call_count(), 2);
    }
}
