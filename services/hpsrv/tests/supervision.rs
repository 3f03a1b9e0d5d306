//! End-to-end supervision against the simulated plant
//!
//! The engine runs on its own task exactly as in the service, with paused
//! tokio time so that minute-long recovery sequences finish instantly.

#![allow(clippy::disallowed_methods)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;

use hpsrv::bus::{BusGate, SimHandle, SimWrite, SimulatedBus};
use hpsrv::config::HpSrvConfig;
use hpsrv::engine::{Engine, EngineHandle};
use hpsrv::hub::{BroadcastHub, ChannelObserver, HubHandle};
use hpsrv::notify::{Notification, Notifier};
use hpsrv::registers::{hp_coil, pump_coil, pump_discrete, pump_holding};

const HP: u8 = 1;
const PUMP: u8 = 10;

#[derive(Debug, Default)]
struct Outbox {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for Outbox {
    async fn notify(&self, notification: &Notification) -> hpsrv::Result<()> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

struct Plant {
    sim: SimHandle,
    engine: EngineHandle,
    hub: HubHandle,
    outbox: Arc<Outbox>,
}

fn start_plant(prepare: impl FnOnce(&SimHandle)) -> Plant {
    let (bus, sim) = SimulatedBus::new();
    sim.enable_plant_model(HP, PUMP);
    prepare(&sim);

    let (hub, hub_handle) = BroadcastHub::new(Default::default());
    tokio::spawn(hub.run());

    let outbox = Arc::new(Outbox::default());
    let (engine, handle) = Engine::new(
        &HpSrvConfig::default(),
        BusGate::new(Box::new(bus)),
        hub_handle.clone(),
        outbox.clone(),
    );
    tokio::spawn(engine.run());

    Plant {
        sim,
        engine: handle,
        hub: hub_handle,
        outbox,
    }
}

fn coil(slave: u8, address: u16, value: bool) -> SimWrite {
    SimWrite::Coil {
        slave,
        address,
        value,
    }
}

#[tokio::test(start_paused = true)]
async fn flow_alarm_cycles_pumps_then_resets_alarm() {
    let plant = start_plant(|sim| {
        sim.set_coil(HP, hp_coil::WATER_FLOW_SWITCH_ALARM, true);
    });

    sleep(Duration::from_secs(50)).await;
    assert!(plant.sim.writes().is_empty());

    // Past the 60 s threshold the circulators are cycled once
    sleep(Duration::from_secs(15)).await;
    assert_eq!(
        plant.sim.writes(),
        vec![
            coil(PUMP, pump_coil::COLD_PUMP, false),
            coil(PUMP, pump_coil::REJECT_PUMP, false),
            coil(PUMP, pump_coil::COLD_PUMP, true),
            coil(PUMP, pump_coil::REJECT_PUMP, true),
        ]
    );

    // The delayed reset clears the alarm coil and nothing else is launched
    sleep(Duration::from_secs(60)).await;
    let writes = plant.sim.writes();
    assert_eq!(writes.len(), 5);
    assert_eq!(writes[4], coil(HP, hp_coil::ALARM_RESET, true));
    assert!(!plant.engine.state().flow_alarm());
}

#[tokio::test(start_paused = true)]
async fn inverter_offline_power_cycles_and_restarts() {
    let plant = start_plant(|sim| {
        sim.set_coil(HP, hp_coil::INVERTER_OFFLINE, true);
        sim.set_coil(HP, hp_coil::BMS_ON_OFF, true);
        sim.set_coil(HP, hp_coil::MAIN_WATER_PUMP, true);
        sim.set_holding(PUMP, pump_holding::COLD_OVERRIDE, 100);
        sim.set_holding(PUMP, pump_holding::REJECT_OVERRIDE, 100);
        sim.set_coil(PUMP, pump_coil::COLD_PUMP, true);
        sim.set_coil(PUMP, pump_coil::REJECT_PUMP, true);
    });

    // Launched at 61 s; de-energized until about 200 s
    sleep(Duration::from_secs(150)).await;
    let writes = plant.sim.writes();
    assert_eq!(writes[0], coil(PUMP, pump_coil::INVERTER_CONTACTOR, true));
    assert_eq!(writes[1], coil(HP, hp_coil::BMS_ON_OFF, false));
    assert!(writes.contains(&SimWrite::Holding {
        slave: PUMP,
        address: pump_holding::REJECT_OVERRIDE,
        value: 0
    }));
    assert!(!plant.engine.state().cold_pump_running());

    // The fault clears while the inverter is unpowered; loops have flow again
    plant.sim.set_coil(HP, hp_coil::INVERTER_OFFLINE, false);
    plant.sim.set_discrete(PUMP, pump_discrete::COLD_NO_FLOW, false);
    plant.sim.set_discrete(PUMP, pump_discrete::REJECT_NO_FLOW, false);

    sleep(Duration::from_secs(150)).await;
    let sequence: Vec<SimWrite> = plant
        .sim
        .writes()
        .into_iter()
        .filter(|w| {
            matches!(w, SimWrite::Coil { slave: PUMP, address: pump_coil::INVERTER_CONTACTOR, .. })
                || matches!(w, SimWrite::Coil { slave: HP, address: hp_coil::BMS_ON_OFF, .. })
        })
        .collect();
    assert_eq!(
        sequence,
        vec![
            coil(PUMP, pump_coil::INVERTER_CONTACTOR, true),
            coil(HP, hp_coil::BMS_ON_OFF, false),
            coil(PUMP, pump_coil::INVERTER_CONTACTOR, false),
            coil(HP, hp_coil::BMS_ON_OFF, true),
        ]
    );

    let sent = plant.outbox.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Heat Pump Inverter Power Cycled");
}

#[tokio::test(start_paused = true)]
async fn observers_receive_changes() {
    let plant = start_plant(|_| {});
    let (observer, mut updates) = ChannelObserver::new(8);
    plant.hub.register(Box::new(observer)).await.unwrap();

    plant.sim.set_coil(PUMP, pump_coil::INVERTER_CONTACTOR, true);
    let payload = updates.recv().await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(value["type"], "p");
    assert_eq!(value["coil"][3], true);

    plant.engine.request_refresh().unwrap();
    let first = updates.recv().await.unwrap();
    let second = updates.recv().await.unwrap();
    assert!(first.contains("\"type\":\"p\""));
    assert!(second.contains("\"type\":\"hp\""));
}
