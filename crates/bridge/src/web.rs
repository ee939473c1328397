use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};
use unitboard_protocol::GPIO_COUNT;

use crate::bridge::{Bridge, CommandError};
use crate::db::{parse_timestamp, Db};
use crate::hub::{ConnectionStatus, HubEvent};
use crate::recorder::RecorderStats;
use crate::state::MirrorStatus;
use crate::tanks::TankStatus;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Bridge,
    pub db: Db,
    pub recipes_dir: PathBuf,
    pub firmware_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    let firmware = ServeDir::new(&app.firmware_dir);

    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/units/{unit_id}", get(api_unit))
        .route("/api/units/{unit_id}/gpio", get(api_unit_gpio))
        .route("/api/units/{unit_id}/select", post(api_select_unit))
        .route("/api/units/{unit_id}/firmware", post(api_update_firmware))
        .route("/api/gpio/bulk", post(api_set_gpio))
        .route("/api/gpio/motor", post(api_set_motor))
        .route("/api/state", post(api_send_state))
        .route("/api/ping", post(api_ping))
        .route("/api/recipe/list", get(api_recipe_list))
        .route("/api/recipe/send", post(api_send_recipe))
        .route("/api/recipe/send/{filename}", post(api_send_recipe_file))
        .route("/api/recipe/{filename}", get(api_recipe_content))
        .route("/api/recording/start", post(api_recording_start))
        .route("/api/recording/pause", post(api_recording_pause))
        .route("/api/recording/stop", post(api_recording_stop))
        .route("/api/recording/status", get(api_recording_status))
        .route("/api/history/chart", get(api_history_chart))
        .route("/api/history/export", get(api_history_export))
        .route("/api/history/summary", get(api_history_summary))
        .route("/ws/status", get(ws_status))
        .nest_service("/firmware", firmware)
        .with_state(app)
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn command_status(e: &CommandError) -> StatusCode {
    match e {
        e if e.is_rejection() => StatusCode::BAD_REQUEST,
        CommandError::FirmwareMissing(_) => StatusCode::NOT_FOUND,
        CommandError::NotConnected | CommandError::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
        CommandError::Upload(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{"success": bool, "error"?: string}` plus any extra fields.
fn outcome_with(result: Result<(), CommandError>, extra: Value) -> Response {
    let (status, mut body) = match result {
        Ok(()) => (StatusCode::OK, json!({ "success": true })),
        Err(e) => (
            command_status(&e),
            json!({ "success": false, "error": e.to_string() }),
        ),
    };
    if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    (status, Json(body)).into_response()
}

fn outcome(result: Result<(), CommandError>) -> Response {
    outcome_with(result, Value::Null)
}

fn rejected(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "success": false, "error": msg.into() }))).into_response()
}

fn internal(context: &str, e: anyhow::Error) -> Response {
    error!("{context}: {e:#}");
    rejected(StatusCode::INTERNAL_SERVER_ERROR, format!("{context}: {e:#}"))
}

// ---------------------------------------------------------------------------
// Status & units
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    mirror: MirrorStatus,
    connection: ConnectionStatus,
    recording: bool,
    selected_unit: u32,
    recorder: RecorderStats,
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let mirror = app.bridge.state().read().await.to_status();
    Json(StatusResponse {
        mirror,
        connection: app.bridge.connection_status(),
        recording: app.bridge.is_recording(),
        selected_unit: app.bridge.selected_unit(),
        recorder: app.bridge.recorder().stats(),
    })
}

async fn api_unit(State(app): State<AppState>, Path(unit_id): Path<u32>) -> Response {
    let st = app.bridge.state().read().await;
    match st.unit(unit_id) {
        Some(unit) => Json(unit.clone()).into_response(),
        None => rejected(StatusCode::NOT_FOUND, format!("unit {unit_id} not found")),
    }
}

async fn api_unit_gpio(State(app): State<AppState>, Path(unit_id): Path<u32>) -> Response {
    let st = app.bridge.state().read().await;
    match st.unit(unit_id) {
        Some(unit) => Json(json!({ "unit_id": unit_id, "gpio_states": unit.gpio })).into_response(),
        None => rejected(StatusCode::NOT_FOUND, format!("unit {unit_id} not found")),
    }
}

async fn api_select_unit(State(app): State<AppState>, Path(unit_id): Path<u32>) -> Response {
    outcome(app.bridge.select_unit(unit_id).await)
}

#[derive(Deserialize)]
struct FirmwareRequest {
    file_path: String,
}

async fn api_update_firmware(
    State(app): State<AppState>,
    Path(unit_id): Path<u32>,
    Json(body): Json<FirmwareRequest>,
) -> Response {
    outcome(app.bridge.update_firmware(unit_id, &body.file_path).await)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GpioRequest {
    unit_id: u32,
    gpio_states: Vec<bool>,
}

async fn api_set_gpio(State(app): State<AppState>, Json(body): Json<GpioRequest>) -> Response {
    let Ok(gpio) = <[bool; GPIO_COUNT]>::try_from(body.gpio_states.as_slice()) else {
        return rejected(
            StatusCode::BAD_REQUEST,
            format!(
                "gpio_states must have exactly {GPIO_COUNT} entries, got {}",
                body.gpio_states.len()
            ),
        );
    };
    outcome(app.bridge.set_gpio(body.unit_id, gpio).await)
}

#[derive(Deserialize)]
struct MotorRequest {
    unit_id: u32,
    is_on: bool,
    #[serde(default)]
    speed: u32,
    #[serde(default)]
    time: u32,
}

async fn api_set_motor(State(app): State<AppState>, Json(body): Json<MotorRequest>) -> Response {
    outcome(
        app.bridge
            .set_motor(body.unit_id, body.is_on, body.speed, body.time)
            .await,
    )
}

#[derive(Deserialize)]
struct StateRequest {
    status: String,
}

async fn api_send_state(State(app): State<AppState>, Json(body): Json<StateRequest>) -> Response {
    match body.status.parse::<TankStatus>() {
        Ok(status) => outcome(app.bridge.send_state_command(status).await),
        Err(e) => rejected(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn api_ping(State(app): State<AppState>) -> Response {
    outcome(app.bridge.ping().await)
}

// ---------------------------------------------------------------------------
// Recipes
// ---------------------------------------------------------------------------

/// A bare `*.json` file name inside `dir`, or `None`.
fn recipe_path(dir: &std::path::Path, filename: &str) -> Option<PathBuf> {
    let name = std::path::Path::new(filename);
    let bare = name.file_name().is_some_and(|n| n == name.as_os_str());
    let json = name.extension().is_some_and(|ext| ext == "json");
    (bare && json).then(|| dir.join(name))
}

async fn load_recipe(app: &AppState, filename: &str) -> Result<Value, Response> {
    let Some(path) = recipe_path(&app.recipes_dir, filename) else {
        return Err(rejected(
            StatusCode::NOT_FOUND,
            format!("invalid recipe file name: {filename}"),
        ));
    };
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), "recipe read failed: {e}");
            return Err(rejected(
                StatusCode::NOT_FOUND,
                format!("recipe file not found: {filename}"),
            ));
        }
    };
    serde_json::from_str(&text).map_err(|e| {
        warn!(path = %path.display(), "recipe is not valid JSON: {e}");
        rejected(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("invalid JSON in recipe file {filename}: {e}"),
        )
    })
}

async fn list_recipes(dir: &std::path::Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(dir = %dir.display(), "recipe directory not found");
            return Ok(names);
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", dir.display())),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_file = entry.file_type().await?.is_file();
        if is_file && path.extension().is_some_and(|ext| ext == "json") {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

async fn api_recipe_list(State(app): State<AppState>) -> Response {
    match list_recipes(&app.recipes_dir).await {
        Ok(names) => {
            let files: Vec<Value> = names
                .into_iter()
                .map(|filename| json!({ "filename": filename }))
                .collect();
            Json(files).into_response()
        }
        Err(e) => internal("recipe list failed", e),
    }
}

async fn api_recipe_content(
    State(app): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    match load_recipe(&app, &filename).await {
        Ok(recipe) => Json(recipe).into_response(),
        Err(resp) => resp,
    }
}

async fn api_send_recipe(State(app): State<AppState>, Json(recipe): Json<Value>) -> Response {
    outcome(app.bridge.send_recipe(recipe).await)
}

async fn api_send_recipe_file(
    State(app): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    match load_recipe(&app, &filename).await {
        Ok(recipe) => {
            info!(%filename, "sending recipe file");
            outcome(app.bridge.send_recipe(recipe).await)
        }
        Err(resp) => resp,
    }
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

async fn api_recording_start(State(app): State<AppState>) -> Response {
    let result = app.bridge.start_recording().await;
    outcome_with(result, json!({ "status": "started", "is_recording": app.bridge.is_recording() }))
}

async fn api_recording_pause(State(app): State<AppState>) -> Response {
    let result = app.bridge.pause_recording().await;
    outcome_with(result, json!({ "status": "paused", "is_recording": app.bridge.is_recording() }))
}

async fn api_recording_stop(State(app): State<AppState>) -> Response {
    let result = app.bridge.stop_recording().await;
    outcome_with(result, json!({ "status": "stopped", "is_recording": app.bridge.is_recording() }))
}

async fn api_recording_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({ "is_recording": app.bridge.is_recording() }))
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RangeQuery {
    start: String,
    end: String,
}

#[derive(Deserialize)]
struct ChartQuery {
    start: String,
    end: String,
    tank_id: Option<u32>,
    /// Comma separated, e.g. `1,2,5`.
    sensor_ids: Option<String>,
}

fn check_range(start: &str, end: &str) -> Result<(), Response> {
    for (name, value) in [("start", start), ("end", end)] {
        if parse_timestamp(value).is_none() {
            return Err(rejected(
                StatusCode::BAD_REQUEST,
                format!("{name} must be YYYY-MM-DD HH:MM:SS, got {value:?}"),
            ));
        }
    }
    Ok(())
}

fn parse_sensor_ids(raw: Option<&str>) -> Result<Vec<u32>, Response> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>().map_err(|_| {
                rejected(StatusCode::BAD_REQUEST, format!("bad sensor id {s:?}"))
            })
        })
        .collect()
}

async fn api_history_chart(State(app): State<AppState>, Query(q): Query<ChartQuery>) -> Response {
    if let Err(resp) = check_range(&q.start, &q.end) {
        return resp;
    }
    let sensor_ids = match parse_sensor_ids(q.sensor_ids.as_deref()) {
        Ok(ids) => ids,
        Err(resp) => return resp,
    };
    match app
        .db
        .query_range(q.start.trim(), q.end.trim(), q.tank_id, &sensor_ids)
        .await
    {
        Ok(points) => Json(points).into_response(),
        Err(e) => internal("history query failed", e),
    }
}

const EXPORT_HEADER: [&str; 6] = ["time", "tank_id", "sensor_id", "value", "stage", "status"];

fn export_file_name(start: &str, end: &str) -> String {
    let clean = |s: &str| -> String {
        s.trim()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    };
    format!("sensor_data_{}_{}.csv", clean(start), clean(end))
}

async fn api_history_export(State(app): State<AppState>, Query(q): Query<RangeQuery>) -> Response {
    if let Err(resp) = check_range(&q.start, &q.end) {
        return resp;
    }
    let rows = match app.db.query_export(q.start.trim(), q.end.trim()).await {
        Ok(rows) => rows,
        Err(e) => return internal("history export failed", e),
    };

    let csv = (|| -> Result<Vec<u8>> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        wtr.write_record(EXPORT_HEADER)?;
        for row in &rows {
            wtr.serialize(row)?;
        }
        wtr.into_inner()
            .map_err(|e| anyhow::anyhow!("failed to finish csv: {}", e.error()))
    })();

    match csv {
        Ok(bytes) => {
            debug!(rows = rows.len(), "history exported");
            let disposition = format!(
                "attachment; filename=\"{}\"",
                export_file_name(&q.start, &q.end)
            );
            (
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                bytes,
            )
                .into_response()
        }
        Err(e) => internal("csv export failed", e),
    }
}

async fn api_history_summary(State(app): State<AppState>) -> Response {
    match app.db.summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => internal("storage summary failed", e),
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum ClientMessage {
    UnitSelect { unit_id: u32 },
}

async fn ws_status(State(app): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| status_ws_loop(app.bridge, socket))
}

async fn handle_client_message(bridge: &Bridge, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::UnitSelect { unit_id }) => {
            if let Err(e) = bridge.select_unit(unit_id).await {
                warn!(unit_id, "ws unit select: {e}");
            }
        }
        Err(e) => debug!("ignoring ws message: {e}"),
    }
}

async fn status_ws_loop(bridge: Bridge, mut socket: WebSocket) {
    let mut rx = bridge.hub().subscribe();
    info!(subscribers = bridge.hub().subscriber_count(), "ws client connected");

    let hello = HubEvent::SystemConnectionStatus(bridge.connection_status());
    match serde_json::to_string(&hello) {
        Ok(text) => {
            if socket.send(WsMessage::Text(text.into())).await.is_err() {
                return;
            }
        }
        Err(e) => warn!("ws: failed to serialize connection status: {e}"),
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(text) => {
                    if socket.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "ws client lagging, events skipped"),
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => handle_client_message(&bridge, text.as_str()).await,
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("ws client disconnected");
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    listener: TcpListener,
    app: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("web ui listening on http://{addr}");
    }
    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::recorder::Recorder;
    use crate::state::UnitMirror;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use unitboard_protocol::{decode, Message};

    struct TestApp {
        app: AppState,
        _dir: TempDir,
    }

    async fn test_app() -> TestApp {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let state = UnitMirror::shared();
        let (recorder, _task) = Recorder::spawn(db.clone(), 16, state.clone());

        let dir = tempfile::tempdir().unwrap();
        let recipes_dir = dir.path().join("recipes");
        let firmware_dir = dir.path().join("firmware");
        std::fs::create_dir(&recipes_dir).unwrap();
        std::fs::create_dir(&firmware_dir).unwrap();

        let config_path = dir.path().join("config.toml").display().to_string();
        let bridge = Bridge::new(
            Hub::new(),
            recorder,
            state,
            config_path,
            Duration::from_secs(5),
        );
        TestApp {
            app: AppState {
                bridge,
                db,
                recipes_dir,
                firmware_dir,
            },
            _dir: dir,
        }
    }

    async fn call(app: &AppState, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = router(app.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn get_json(app: &AppState, uri: &str) -> (StatusCode, Value) {
        let req = Request::get(uri).body(Body::empty()).unwrap();
        let (status, body) = call(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_json(app: &AppState, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body) = call(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn seed_packet(db: &Db) {
        let line = r#"{"CMD":"SENSOR","ORDER":1,"DATE":"2024-01-01","TIME":"00:00:05","VALUES":[{"TANK_ID":101,"SENSOR_ID":1,"VALUE":"23.5"},{"TANK_ID":101,"SENSOR_ID":2,"VALUE":"7.25"}],"STATE":[{"TANK_ID":101,"STAGE":3,"STATUS":"Run"}]}"#;
        let Message::Sensor(packet) = decode(line).unwrap() else {
            panic!("not a sensor packet");
        };
        db.persist(&packet).await.unwrap();
    }

    // -- Status ---------------------------------------------------------------

    #[tokio::test]
    async fn status_lists_all_units() {
        let t = test_app().await;
        let (status, body) = get_json(&t.app, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["units"].as_array().unwrap().len(), 32);
        assert_eq!(body["recording"], false);
        assert_eq!(body["connection"]["connected"], false);
        assert_eq!(body["recorder"]["dropped"], 0);
    }

    #[tokio::test]
    async fn unit_lookup() {
        let t = test_app().await;
        let (status, body) = get_json(&t.app, "/api/units/4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tank_id"], 105);

        let (status, _) = get_json(&t.app, "/api/units/32").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get_json(&t.app, "/api/units/3/gpio").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gpio_states"], json!(vec![false; 8]));
    }

    // -- Commands -------------------------------------------------------------

    #[tokio::test]
    async fn gpio_arity_rejected() {
        let t = test_app().await;
        let (status, body) = post_json(
            &t.app,
            "/api/gpio/bulk",
            json!({"unit_id": 0, "gpio_states": vec![true; 7]}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("exactly 8"));
    }

    #[tokio::test]
    async fn validation_precedes_connectivity() {
        let t = test_app().await;
        let (status, _) = post_json(
            &t.app,
            "/api/gpio/motor",
            json!({"unit_id": 1, "is_on": true, "speed": 2500, "time": 5}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_json(
            &t.app,
            "/api/gpio/bulk",
            json!({"unit_id": 99, "gpio_states": vec![false; 8]}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post_json(&t.app, "/api/state", json!({"status": "Sleep"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn command_without_controller_reports_failure() {
        let t = test_app().await;
        let (status, body) = post_json(&t.app, "/api/ping", json!({})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("no controller"));
    }

    #[tokio::test]
    async fn select_moves_cursor_even_when_offline() {
        let t = test_app().await;
        let (status, _) = post_json(&t.app, "/api/units/7/select", json!({})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(t.app.bridge.selected_unit(), 7);
    }

    // -- Recipes --------------------------------------------------------------

    #[tokio::test]
    async fn recipe_list_and_content() {
        let t = test_app().await;
        let dir = &t.app.recipes_dir;
        std::fs::write(dir.join("b.json"), r#"{"CMD":"REF","IDX":2}"#).unwrap();
        std::fs::write(dir.join("a.json"), r#"{"CMD":"REF","IDX":1}"#).unwrap();
        std::fs::write(dir.join("notes.txt"), "skip me").unwrap();

        let (status, body) = get_json(&t.app, "/api/recipe/list").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{"filename": "a.json"}, {"filename": "b.json"}]));

        let (status, body) = get_json(&t.app, "/api/recipe/b.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["IDX"], 2);

        let (status, _) = get_json(&t.app, "/api/recipe/missing.json").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(&t.app, "/api/recipe/notes.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn recipe_path_rejects_traversal() {
        let dir = std::path::Path::new("/srv/recipes");
        for name in ["../secret.json", "sub/a.json", "..", "", "a.toml", "/etc/a.json"] {
            assert_eq!(recipe_path(dir, name), None, "{name} accepted");
        }
        assert_eq!(
            recipe_path(dir, "a.json"),
            Some(PathBuf::from("/srv/recipes/a.json"))
        );
    }

    #[tokio::test]
    async fn recipe_with_wrong_kind_rejected() {
        let t = test_app().await;
        let (status, body) =
            post_json(&t.app, "/api/recipe/send", json!({"CMD": "PING", "IDX": 1})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("REF"));
    }

    // -- Recording ------------------------------------------------------------

    #[tokio::test]
    async fn recording_flag_follows_controls() {
        let t = test_app().await;

        let (_, body) = post_json(&t.app, "/api/recording/start", json!({})).await;
        assert_eq!(body["is_recording"], true);
        assert_eq!(body["status"], "started");
        let (_, body) = get_json(&t.app, "/api/recording/status").await;
        assert_eq!(body["is_recording"], true);

        let (_, body) = post_json(&t.app, "/api/recording/pause", json!({})).await;
        assert_eq!(body["is_recording"], false);
        let (_, body) = get_json(&t.app, "/api/recording/status").await;
        assert_eq!(body["is_recording"], false);
    }

    // -- History --------------------------------------------------------------

    #[tokio::test]
    async fn chart_query_filters_sensors() {
        let t = test_app().await;
        seed_packet(&t.app.db).await;

        let (status, body) = get_json(
            &t.app,
            "/api/history/chart?start=2024-01-01%2000:00:00&end=2024-01-02%2000:00:00&tank_id=101&sensor_ids=2",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([{"time": "2024-01-01 00:00:05", "value": 7.25, "sensor_id": 2}])
        );

        let (status, _) =
            get_json(&t.app, "/api/history/chart?start=yesterday&end=2024-01-02%2000:00:00").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_json(
            &t.app,
            "/api/history/chart?start=2024-01-01%2000:00:00&end=2024-01-02%2000:00:00&sensor_ids=1,x",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn export_is_csv() {
        let t = test_app().await;
        seed_packet(&t.app.db).await;

        let req = Request::get(
            "/api/history/export?start=2024-01-01%2000:00:00&end=2024-01-02%2000:00:00",
        )
        .body(Body::empty())
        .unwrap();
        let resp = router(t.app.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/csv; charset=utf-8"
        );
        let disposition = resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.contains("sensor_data_2024-01-01-00-00-00_"), "{disposition}");

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "time,tank_id,sensor_id,value,stage,status",
                "2024-01-01 00:00:05,101,1,23.5,3,Run",
                "2024-01-01 00:00:05,101,2,7.25,3,Run",
            ]
        );
    }

    #[tokio::test]
    async fn empty_export_still_has_header() {
        let t = test_app().await;
        let req = Request::get(
            "/api/history/export?start=2024-01-01%2000:00:00&end=2024-01-02%2000:00:00",
        )
        .body(Body::empty())
        .unwrap();
        let (status, body) = call(&t.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "time,tank_id,sensor_id,value,stage,status\n"
        );
    }

    #[tokio::test]
    async fn summary_counts_rows() {
        let t = test_app().await;
        seed_packet(&t.app.db).await;

        let (status, body) = get_json(&t.app, "/api/history/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["packets"], 1);
        assert_eq!(body["readings"], 2);
        assert_eq!(body["states"], 1);
        assert_eq!(body["sensor_ids"], json!([1, 2]));
    }

    // -- Firmware & WebSocket -------------------------------------------------

    #[tokio::test]
    async fn firmware_images_served() {
        let t = test_app().await;
        std::fs::write(t.app.firmware_dir.join("fw.bin"), b"image").unwrap();

        let req = Request::get("/firmware/fw.bin").body(Body::empty()).unwrap();
        let (status, body) = call(&t.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"image");

        let req = Request::get("/firmware/other.bin").body(Body::empty()).unwrap();
        let (status, _) = call(&t.app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn firmware_upload_failure_is_bad_gateway() {
        let t = test_app().await;
        std::fs::write(t.app.firmware_dir.join("fw.bin"), b"image").unwrap();

        // Bind then drop so nothing listens on the upload port.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        std::fs::write(
            t._dir.path().join("config.toml"),
            format!(
                "[firmware]\ndir = {:?}\nupload_url = \"http://127.0.0.1:{port}/upload\"\n",
                t.app.firmware_dir.display().to_string()
            ),
        )
        .unwrap();

        let (status, body) = post_json(
            &t.app,
            "/api/units/0/firmware",
            json!({"file_path": "fw.bin"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("firmware upload failed"));

        let (status, _) = post_json(
            &t.app,
            "/api/units/0/firmware",
            json!({"file_path": "missing.bin"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_unit_select_message() {
        let t = test_app().await;
        handle_client_message(&t.app.bridge, r#"{"type":"UNIT_SELECT","unit_id":9}"#).await;
        assert_eq!(t.app.bridge.selected_unit(), 9);

        // Unknown or malformed messages are ignored.
        handle_client_message(&t.app.bridge, r#"{"type":"NOPE"}"#).await;
        handle_client_message(&t.app.bridge, "garbage").await;
        assert_eq!(t.app.bridge.selected_unit(), 9);
    }
}
