/// HTTP and WebSocket front end.
///
/// Every `/api/*` endpoint is a thin wrapper that runs one controller call on the
/// blocking pool and turns the result into `{success, message?, ...}`. Failures
/// never surface as HTTP errors; a panicking handler is reported as an internal
/// failure the same way.
///
/// `/ws` pushes a `status_update` on connect, on every committed change and on
/// `request_status`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Duration};

use crate::arduino_connection::{Direction, StepSize};
use crate::scanner_state::Mode;
use crate::status::{ClientEvent, ServerEvent, StatusSnapshot};
use crate::workflow::{CalibrateAction, ScannerController, StripAction, WorkflowError, WorkflowResult};

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Ping interval to keep idle browser connections open.
const PING_INTERVAL: Duration = Duration::from_secs(30);

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

type SharedController = Arc<ScannerController>;

/// Body of every `/api/*` response
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ApiReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame1_pos: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_advance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ApiReply {
    fn ok() -> Self {
        Self { success: true, ..Self::default() }
    }

    fn failure(e: &WorkflowError) -> Self {
        Self { success: false, message: Some(e.to_string()), ..Self::default() }
    }
}

fn reply<T>(result: WorkflowResult<T>, on_success: impl FnOnce(T) -> ApiReply) -> Json<ApiReply> {
    Json(match result {
        Ok(value) => on_success(value),
        Err(e) => ApiReply::failure(&e),
    })
}

/// Run a controller call on the blocking pool; serial and subprocess I/O must not
/// stall the async workers.
async fn run_blocking<T, F>(controller: &SharedController, f: F) -> WorkflowResult<T>
where
    T: Send + 'static,
    F: FnOnce(&ScannerController) -> WorkflowResult<T> + Send + 'static,
{
    let controller = Arc::clone(controller);
    match tokio::task::spawn_blocking(move || f(&controller)).await {
        Ok(result) => result,
        Err(e) => {
            error!(target: "web", "Request handler crashed: {}", e);
            Err(WorkflowError::Internal(e.to_string()))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewRollRequest {
    pub roll_name: String,
    pub resume: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewStripRequest {
    pub action: StripAction,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MoveRequest {
    pub direction: Direction,
    pub size: StepSize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CalibrateRequest {
    pub action: CalibrateAction,
    pub frame1_pos: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StepSizesRequest {
    pub fine_step: i64,
    pub coarse_step: i64,
}

pub fn router(controller: SharedController) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/status", get(status))
        .route("/api/connect_arduino", post(connect_arduino))
        .route("/api/new_roll", post(new_roll))
        .route("/api/close_roll", post(close_roll))
        .route("/api/new_strip", post(new_strip))
        .route("/api/move", post(move_film))
        .route("/api/advance_frame", post(advance_frame))
        .route("/api/backup_frame", post(backup_frame))
        .route("/api/capture", post(capture))
        .route("/api/test_capture", post(test_capture))
        .route("/api/calibrate", post(calibrate))
        .route("/api/toggle_mode", post(toggle_mode))
        .route("/api/toggle_auto_advance", post(toggle_auto_advance))
        .route("/api/toggle_step_size", post(toggle_step_size))
        .route("/api/zero_position", post(zero_position))
        .route("/api/autofocus", post(autofocus))
        .route("/api/get_preview", post(get_preview))
        .route("/api/update_step_sizes", post(update_step_sizes))
        .with_state(controller)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(controller: SharedController, bind: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", bind, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(target: "web", "Film scanner listening on http://{}", addr);

    axum::serve(listener, router(controller))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Web server failed")?;
    info!(target: "web", "Web server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(target: "web", "Ctrl-C received, shutting down"),
        Err(e) => {
            error!(target: "web", "Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn status(State(controller): State<SharedController>) -> Json<StatusSnapshot> {
    match run_blocking(&controller, |c| Ok(c.refresh_status())).await {
        Ok(snapshot) => Json(snapshot),
        Err(_) => Json(controller.status()),
    }
}

async fn connect_arduino(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.connect_arduino()).await;
    reply(result, |_| ApiReply { message: Some("Arduino connected".to_string()), ..ApiReply::ok() })
}

async fn new_roll(State(controller): State<SharedController>, Json(req): Json<NewRollRequest>) -> Json<ApiReply> {
    let result = run_blocking(&controller, move |c| c.new_roll(&req.roll_name, req.resume)).await;
    reply(result, |_| ApiReply::ok())
}

async fn close_roll(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.close_roll()).await;
    reply(result, |_| ApiReply::ok())
}

async fn new_strip(State(controller): State<SharedController>, Json(req): Json<NewStripRequest>) -> Json<ApiReply> {
    let result = run_blocking(&controller, move |c| c.new_strip(req.action)).await;
    reply(result, |_| ApiReply::ok())
}

async fn move_film(State(controller): State<SharedController>, Json(req): Json<MoveRequest>) -> Json<ApiReply> {
    let result = run_blocking(&controller, move |c| c.move_film(req.direction, req.size)).await;
    reply(result, |position| ApiReply { position: Some(position), ..ApiReply::ok() })
}

async fn advance_frame(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.advance_frame()).await;
    reply(result, |position| ApiReply { position: Some(position), ..ApiReply::ok() })
}

async fn backup_frame(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.backup_frame()).await;
    reply(result, |position| ApiReply { position: Some(position), ..ApiReply::ok() })
}

async fn capture(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.capture()).await;
    reply(result, |frame| ApiReply { frame_count: Some(frame), ..ApiReply::ok() })
}

async fn test_capture(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.test_capture()).await;
    reply(result, |detail| ApiReply { message: Some(detail), ..ApiReply::ok() })
}

async fn calibrate(State(controller): State<SharedController>, Json(req): Json<CalibrateRequest>) -> Json<ApiReply> {
    let result = run_blocking(&controller, move |c| c.calibrate(req.action, req.frame1_pos)).await;
    reply(result, |cal| ApiReply {
        frame1_pos: cal.frame1_pos,
        frame_advance: cal.frame_advance,
        ..ApiReply::ok()
    })
}

async fn toggle_mode(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.toggle_mode()).await;
    reply(result, |mode| ApiReply { mode: Some(mode), ..ApiReply::ok() })
}

async fn toggle_auto_advance(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.toggle_auto_advance()).await;
    reply(result, |on| ApiReply { enabled: Some(on), ..ApiReply::ok() })
}

async fn toggle_step_size(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.toggle_step_size()).await;
    reply(result, |large| ApiReply { enabled: Some(large), ..ApiReply::ok() })
}

async fn zero_position(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.zero_position()).await;
    reply(result, |_| ApiReply { position: Some(0), ..ApiReply::ok() })
}

async fn autofocus(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.autofocus()).await;
    reply(result, |_| ApiReply::ok())
}

async fn get_preview(State(controller): State<SharedController>) -> Json<ApiReply> {
    let result = run_blocking(&controller, |c| c.get_preview()).await;
    reply(result, |jpeg| ApiReply { image: Some(BASE64.encode(jpeg)), ..ApiReply::ok() })
}

async fn update_step_sizes(State(controller): State<SharedController>, Json(req): Json<StepSizesRequest>) -> Json<ApiReply> {
    let result = run_blocking(&controller, move |c| c.update_step_sizes(req.fine_step, req.coarse_step)).await;
    reply(result, |_| ApiReply::ok())
}

// =============================================================================
// WebSocket
// =============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(controller): State<SharedController>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, controller))
}

fn status_message(snapshot: StatusSnapshot) -> Option<Message> {
    match serde_json::to_string(&ServerEvent::StatusUpdate(snapshot)) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            error!(target: "web", "Failed to serialize status: {}", e);
            None
        }
    }
}

async fn current_status(controller: &SharedController) -> StatusSnapshot {
    run_blocking(controller, |c| Ok(c.refresh_status()))
        .await
        .unwrap_or_else(|_| controller.status())
}

async fn handle_socket(socket: WebSocket, controller: SharedController) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates = controller.subscribe();
    info!(target: "web", "Client connected ({} watching)", controller.hub().subscriber_count());

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(64);

    if let Some(msg) = status_message(current_status(&controller).await) {
        let _ = outgoing_tx.send(msg).await;
    }

    let outgoing_handle = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let updates_tx = outgoing_tx.clone();
    let broadcast_handle = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(snapshot) => {
                    let Some(msg) = status_message(snapshot) else { continue };
                    if updates_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(target: "web", "Client lagged, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let ping_tx = outgoing_tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_interval = interval(PING_INTERVAL);
        loop {
            ping_interval.tick().await;
            if ping_tx.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                break;
            }
        }
    });

    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(ClientEvent::RequestStatus) => {
                    if let Some(msg) = status_message(current_status(&controller).await) {
                        if outgoing_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => debug!(target: "web", "Ignoring client message: {}", e),
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = outgoing_tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(target: "web", "WebSocket error: {}", e);
                break;
            }
        }
    }

    ping_handle.abort();
    broadcast_handle.abort();
    outgoing_handle.abort();
    info!(target: "web", "Client disconnected");
}
