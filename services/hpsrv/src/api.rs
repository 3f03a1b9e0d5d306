//! HTTP and WebSocket API
//!
//! Status endpoints read the retained state from the engine; command
//! endpoints go through `PlantControl`, so every bus access still passes the
//! gate. `/ws` registers a hub observer per connection.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{Json, Response},
    routing::{get, patch, post},
    Form, Router,
};
use common::{AppError, SuccessResponse};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::engine::EngineHandle;
use crate::hub::{ChannelObserver, HubHandle};
use crate::plant::{PlantControl, StartOutcome};
use crate::registers::{hp_holding, parse_register_key};
use crate::snapshot::{DeviceKind, PlantState};

type ApiResult<T> = std::result::Result<Json<SuccessResponse<T>>, AppError>;

#[derive(Clone)]
pub struct AppState {
    pub plant: PlantControl,
    pub engine: EngineHandle,
    pub hub: HubHandle,
    /// Per-connection WebSocket buffer
    pub observer_buffer: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub dropped_updates: u64,
}

/// Operator dashboard summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub on: bool,
    pub setpoint: f32,
    pub in_temperature: f32,
    pub out_temperature: f32,
    pub speed: u16,
    pub current: f32,
    pub voltage: f32,
    pub cold_pump: bool,
    pub cold_flow: bool,
    pub reject_pump: bool,
    pub reject_flow: bool,
    pub alarm: bool,
}

impl StatusResponse {
    pub fn from_state(state: &PlantState) -> Self {
        let holding = |address| state.heat_pump().holding_at(address).unwrap_or(0);
        Self {
            on: state.heat_pump_on(),
            setpoint: tenths(holding(hp_holding::COOLING_SETPOINT)),
            in_temperature: tenths(holding(hp_holding::WATER_IN_TEMP)),
            out_temperature: tenths(holding(hp_holding::WATER_OUT_TEMP)),
            speed: holding(hp_holding::COMPRESSOR_SPEED),
            current: tenths(holding(hp_holding::MOTOR_CURRENT)),
            voltage: f32::from(holding(hp_holding::MOTOR_VOLTAGE)),
            cold_pump: state.cold_pump_running(),
            cold_flow: !state.cold_no_flow(),
            reject_pump: state.reject_pump_running(),
            reject_flow: !state.reject_no_flow(),
            alarm: !state.heat_pump().alarm_coils().is_empty(),
        }
    }
}

/// Compact values for the data view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    pub cold_pump: bool,
    pub cold_flow: bool,
    pub reject_pump: bool,
    pub reject_flow: bool,
    pub heatpump_on: bool,
    pub setpoint: f64,
    pub in_temp: f64,
    pub out_temp: f64,
}

impl DataResponse {
    pub fn from_state(state: &PlantState) -> Self {
        let holding = |address| f64::from(state.heat_pump().holding_at(address).unwrap_or(0)) / 10.0;
        Self {
            cold_pump: state.cold_pump_running(),
            cold_flow: !state.cold_no_flow(),
            reject_pump: state.reject_pump_running(),
            reject_flow: !state.reject_no_flow(),
            heatpump_on: state.heat_pump_on(),
            setpoint: holding(hp_holding::COOLING_SETPOINT),
            in_temp: holding(hp_holding::WATER_IN_TEMP),
            out_temp: holding(hp_holding::WATER_OUT_TEMP),
        }
    }
}

fn tenths(raw: u16) -> f32 {
    f32::from(raw) / 10.0
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub message: String,
}

impl CommandResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CoilResponse {
    pub coil: String,
    pub value: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteSummary {
    pub written: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetpointResponse {
    pub setpoint: f64,
    pub raw: u16,
}

#[derive(Debug, Deserialize)]
pub struct CoilQuery {
    pub coil: String,
}

#[derive(Debug, Deserialize)]
pub struct SetpointQuery {
    pub setpoint: f64,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub heatpump: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/getData", get(get_data))
        .route("/ws", get(ws_handler))
        .route("/toggleCoil", patch(toggle_coil))
        .route("/setHoldingRegisters", post(set_holding_registers))
        .route("/startHeatPump", patch(start_heat_pump))
        .route("/stopHeatPump", patch(stop_heat_pump))
        .route("/controlHeatPump", post(control_heat_pump))
        .route("/setHeatPump", patch(set_heat_pump))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "hpsrv".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dropped_updates: state.hub.dropped_count(),
    })
}

async fn get_status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    Ok(Json(SuccessResponse::new(StatusResponse::from_state(
        &state.engine.state(),
    ))))
}

async fn get_data(State(state): State<AppState>) -> ApiResult<DataResponse> {
    Ok(Json(SuccessResponse::new(DataResponse::from_state(
        &state.engine.state(),
    ))))
}

async fn toggle_coil(
    State(state): State<AppState>,
    Query(query): Query<CoilQuery>,
) -> ApiResult<CoilResponse> {
    let (kind, address) = parse_register_key(&query.coil, "hpc", "pc")
        .ok_or_else(|| AppError::bad_request(format!("Unknown coil: {}", query.coil)))?;
    let value = state.plant.toggle_coil(kind, address).await?;
    Ok(Json(SuccessResponse::new(CoilResponse {
        coil: query.coil,
        value,
    })))
}

async fn set_holding_registers(
    State(state): State<AppState>,
    Form(fields): Form<Vec<(String, String)>>,
) -> ApiResult<WriteSummary> {
    let mut writes = Vec::with_capacity(fields.len());
    for (key, value) in fields {
        let (kind, address) = parse_register_key(&key, "hph", "ph")
            .ok_or_else(|| AppError::bad_request(format!("Unknown register: {key}")))?;
        let value: u16 = value
            .trim()
            .parse()
            .map_err(|_| AppError::bad_request(format!("Invalid value for {key}: {value}")))?;
        writes.push((key, kind, address, value));
    }

    let spacing = state.plant.timing().register_write_spacing();
    let mut written = Vec::new();
    let mut failed = Vec::new();
    for (key, kind, address, value) in writes {
        match state.plant.write_holding(kind, address, value).await {
            Ok(()) => written.push(key),
            Err(e) => {
                error!("Write {} = {} failed: {}", key, value, e);
                failed.push(key);
            },
        }
        // The pump controller stores some registers in EEPROM
        if kind == DeviceKind::PumpController {
            tokio::time::sleep(spacing).await;
        }
    }

    if !failed.is_empty() {
        return Err(AppError::bad_gateway("Register write failed").with_details(failed.join(", ")));
    }
    Ok(Json(SuccessResponse::new(WriteSummary { written })))
}

async fn start_heat_pump(State(state): State<AppState>) -> ApiResult<CommandResponse> {
    let message = match state.plant.command_start().await? {
        StartOutcome::AlreadyRunning => "Heat pump is already running",
        StartOutcome::Starting => "Heat pump is starting",
    };
    info!("{}", message);
    Ok(Json(SuccessResponse::new(CommandResponse::new(message))))
}

async fn stop_heat_pump(State(state): State<AppState>) -> ApiResult<CommandResponse> {
    state.plant.command_stop().await?;
    info!("Heat pump stop requested");
    Ok(Json(SuccessResponse::new(CommandResponse::new(
        "Heat pump is stopping",
    ))))
}

async fn control_heat_pump(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> ApiResult<CommandResponse> {
    if request.heatpump {
        start_heat_pump(State(state)).await
    } else {
        stop_heat_pump(State(state)).await
    }
}

async fn set_heat_pump(
    State(state): State<AppState>,
    Query(query): Query<SetpointQuery>,
) -> ApiResult<SetpointResponse> {
    let raw = state.plant.set_cooling_setpoint(query.setpoint).await?;
    info!("Cooling setpoint set to {}", query.setpoint);
    Ok(Json(SuccessResponse::new(SetpointResponse {
        setpoint: query.setpoint,
        raw,
    })))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (observer, mut updates) = ChannelObserver::new(state.observer_buffer);
    let id = match state.hub.register(Box::new(observer)).await {
        Ok(id) => id,
        Err(e) => {
            warn!("WebSocket observer not registered: {}", e);
            return;
        },
    };
    info!("WebSocket observer {} connected", id);

    // New observers get both snapshots straight away
    if let Err(e) = state.engine.request_refresh() {
        warn!("Refresh not requested: {}", e);
    }

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(payload) => {
                    if sender.send(Message::Text(payload.to_string().into())).await.is_err() {
                        break;
                    }
                },
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => debug!("Ignoring message from observer {}", id),
            },
        }
    }

    state.hub.unregister(id).await;
    info!("WebSocket observer {} disconnected", id);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use tokio::time::Instant;
    use tower::ServiceExt;

    use super::*;
    use crate::bus::{BusGate, SimHandle, SimulatedBus};
    use crate::config::HpSrvConfig;
    use crate::engine::Engine;
    use crate::hub::BroadcastHub;
    use crate::notify::LogNotifier;
    use crate::registers::{hp_coil, pump_coil, pump_discrete, pump_holding};

    const HP: u8 = 1;
    const PUMP: u8 = 10;

    async fn setup() -> (Router, Engine, SimHandle) {
        let (bus, sim) = SimulatedBus::new();
        let (hub, hub_handle) = BroadcastHub::new(Default::default());
        tokio::spawn(hub.run());
        let (engine, handle) = Engine::new(
            &HpSrvConfig::default(),
            BusGate::new(Box::new(bus)),
            hub_handle.clone(),
            Arc::new(LogNotifier),
        );
        let app = router(AppState {
            plant: engine.plant(),
            engine: handle,
            hub: hub_handle,
            observer_buffer: 16,
        });
        (app, engine, sim)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Body, content_type: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", content_type)
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_status_reflects_retained_state() {
        let (app, mut engine, sim) = setup().await;
        sim.set_coil(HP, hp_coil::BMS_ON_OFF, true);
        sim.set_holding(HP, hp_holding::COOLING_SETPOINT, 125);
        sim.set_holding(HP, hp_holding::MOTOR_VOLTAGE, 230);
        sim.set_coil(PUMP, pump_coil::COLD_PUMP, true);
        sim.set_discrete(PUMP, pump_discrete::REJECT_NO_FLOW, true);
        engine.tick(Instant::now()).await;

        let (status, body) = call(&app, Method::GET, "/status", Body::empty(), "application/json").await;
        assert_eq!(status, StatusCode::OK);
        let data: StatusResponse = serde_json::from_value(body["data"].clone()).unwrap();
        assert!(data.on);
        assert_eq!(data.setpoint, 12.5);
        assert_eq!(data.voltage, 230.0);
        assert!(data.cold_pump && data.cold_flow);
        assert!(!data.reject_flow);
        assert!(!data.alarm);

        let (_, body) = call(&app, Method::GET, "/getData", Body::empty(), "application/json").await;
        assert_eq!(body["data"]["heatpump_on"], true);
        assert_eq!(body["data"]["setpoint"], 12.5);
    }

    #[tokio::test]
    async fn test_toggle_coil() {
        let (app, _engine, sim) = setup().await;

        let (status, body) = call(&app, Method::PATCH, "/toggleCoil?coil=pc4", Body::empty(), "application/json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["value"], true);
        assert_eq!(sim.coil(PUMP, pump_coil::INVERTER_CONTACTOR), Some(true));

        let (status, body) = call(&app, Method::PATCH, "/toggleCoil?coil=xx1", Body::empty(), "application/json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_holding_registers_form() {
        let (app, _engine, sim) = setup().await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/setHoldingRegisters",
            Body::from("hph13=120&ph4=100"),
            "application/x-www-form-urlencoded",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["written"].as_array().unwrap().len(), 2);
        assert_eq!(sim.holding(HP, 13), Some(120));
        assert_eq!(sim.holding(PUMP, pump_holding::REJECT_OVERRIDE), Some(100));

        let (status, _) = call(
            &app,
            Method::POST,
            "/setHoldingRegisters",
            Body::from("hph13=abc"),
            "application/x-www-form-urlencoded",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_setpoint_written_in_tenths() {
        let (app, _engine, sim) = setup().await;
        let (status, body) = call(&app, Method::PATCH, "/setHeatPump?setpoint=7.5", Body::empty(), "application/json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["raw"], 75);
        assert_eq!(sim.holding(HP, hp_holding::COOLING_SETPOINT), Some(75));
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_heat_pump_stop() {
        let (app, _engine, sim) = setup().await;
        sim.set_coil(HP, hp_coil::BMS_ON_OFF, true);

        let (status, body) = call(
            &app,
            Method::POST,
            "/controlHeatPump",
            Body::from(r#"{"heatpump":false}"#),
            "application/json",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["message"], "Heat pump is stopping");
        assert_eq!(sim.coil(HP, hp_coil::BMS_ON_OFF), Some(false));
    }

    #[tokio::test]
    async fn test_bus_failure_maps_to_bad_gateway() {
        let (app, _engine, sim) = setup().await;
        sim.fail_slave(HP, true);
        let (status, body) = call(&app, Method::PATCH, "/startHeatPump", Body::empty(), "application/json").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], 502);
    }
}
