//! Heat pump supervisory service (hpsrv)

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use common::bootstrap_args::ServiceArgs;
use common::logging::{self, LogConfig};
use tracing::{error, info};

use hpsrv::api::{self, AppState};
use hpsrv::bus::{BusGate, ModbusRtuBus, RegisterBus, SimulatedBus};
use hpsrv::config::HpSrvConfig;
use hpsrv::datalog::CsvDataLog;
use hpsrv::engine::Engine;
use hpsrv::hub::BroadcastHub;
use hpsrv::notify;
use hpsrv::registers::{hp_holding, pump_discrete, pump_input};

#[derive(Debug, Parser)]
#[command(name = "hpsrv", version, about = "Heat pump and pump controller supervisory service")]
struct Args {
    #[command(flatten)]
    service: ServiceArgs,

    /// Run against the built-in plant simulator instead of the serial port
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = HpSrvConfig::load(&args.service.config)
        .with_context(|| format!("loading {}", args.service.config.display()))?;

    logging::init_with_config(LogConfig {
        service_name: "hpsrv".to_string(),
        log_dir: config.logging.log_dir.clone(),
        level: args.service.parse_log_level(),
        enable_json: config.logging.json,
        ansi: !args.service.no_color,
    })
    .map_err(|e| anyhow!("logging init failed: {e}"))?;

    if args.service.validate {
        print!("{}", config.to_yaml()?);
        info!("Configuration is valid");
        return Ok(());
    }

    // Field bus
    let bus: Box<dyn RegisterBus> = if args.simulate {
        info!("Using simulated plant");
        simulated_plant(&config)
    } else {
        info!(
            "Opening {} at {} baud",
            config.serial.port, config.serial.baud_rate
        );
        Box::new(ModbusRtuBus::open(&config.serial).context("opening serial port")?)
    };
    let gate = BusGate::new(bus);

    // Broadcast hub
    let (hub, hub_handle) = BroadcastHub::new(config.hub.hub_config());
    tokio::spawn(hub.run());

    // Supervisor engine
    let notifier = Arc::from(notify::from_config(config.notify.webhook_url.as_deref())?);
    let (mut engine, engine_handle) = Engine::new(&config, gate, hub_handle.clone(), notifier);
    if let Some(path) = &config.datalog.csv_path {
        engine = engine.with_datalog(Box::new(CsvDataLog::open(path)?));
    }
    let plant = engine.plant();
    tokio::spawn(engine.run());

    // HTTP API
    let app = api::router(AppState {
        plant,
        engine: engine_handle,
        hub: hub_handle,
        observer_buffer: config.hub.observer_buffer,
    });
    let addr: SocketAddr = config
        .api
        .bind_address
        .parse()
        .context("parsing api.bind_address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("API listening on {}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let signal = common::wait_for_shutdown().await;
            info!("Received {:?}, shutting down", signal);
        })
        .await
    {
        error!("API server error: {}", e);
        return Err(e.into());
    }

    info!("hpsrv stopped");
    Ok(())
}

/// Simulator preloaded with plausible readings; commands drive the status
/// registers like the real plant
fn simulated_plant(config: &HpSrvConfig) -> Box<dyn RegisterBus> {
    let hp = config.devices.heat_pump_slave;
    let pump = config.devices.pump_slave;
    let (bus, sim) = SimulatedBus::new();
    sim.enable_plant_model(hp, pump);

    sim.set_holding(hp, hp_holding::WATER_IN_TEMP, 120);
    sim.set_holding(hp, hp_holding::WATER_OUT_TEMP, 75);
    sim.set_holding(hp, hp_holding::COOLING_SETPOINT, 70);
    sim.set_holding(hp, hp_holding::MOTOR_VOLTAGE, 230);
    sim.set_discrete(pump, pump_discrete::COLD_NO_FLOW, true);
    sim.set_discrete(pump, pump_discrete::REJECT_NO_FLOW, true);
    sim.set_input(pump, pump_input::GROUND_LOOP_IN_TEMP, 140);
    sim.set_input(pump, pump_input::GROUND_LOOP_OUT_TEMP, 150);
    sim.set_input(pump, pump_input::INSOLATION, 420);
    Box::new(bus)
}
