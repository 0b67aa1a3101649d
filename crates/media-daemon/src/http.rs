use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use media_proto::protocol::{Control, ControlData, Response};
use media_proto::record::{AggregateView, TabMediaRecord};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::core::CoordinatorEvent;

#[derive(Clone)]
struct HttpState {
    event_tx: mpsc::Sender<CoordinatorEvent>,
}

#[derive(Deserialize)]
struct ControlBody {
    action: String,
    #[serde(default)]
    data: ControlData,
}

type ApiError = (StatusCode, Json<Response>);

pub fn start_server(
    bind_address: String,
    port: u16,
    event_tx: mpsc::Sender<CoordinatorEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

pub fn router(event_tx: mpsc::Sender<CoordinatorEvent>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/tabs", get(list_tabs))
        .route("/api/ping", get(ping))
        .route("/api/control", post(control_with_body))
        .route("/api/control/:action", get(control).post(control))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { event_tx })
}

async fn get_state(State(state): State<HttpState>) -> Result<Json<AggregateView>, ApiError> {
    let (tx, rx) = oneshot::channel();
    send(&state, CoordinatorEvent::GetState(tx)).await?;
    rx.await.map(Json).map_err(|_| unavailable())
}

async fn list_tabs(
    State(state): State<HttpState>,
) -> Result<Json<Vec<TabMediaRecord>>, ApiError> {
    let (tx, rx) = oneshot::channel();
    send(&state, CoordinatorEvent::ListTabs(tx)).await?;
    rx.await.map(Json).map_err(|_| unavailable())
}

async fn ping() -> Json<Response> {
    Json(Response::pong())
}

async fn control(
    State(state): State<HttpState>,
    Path(action): Path<String>,
) -> Result<Json<Response>, ApiError> {
    forward(&state, &action, &ControlData::default()).await
}

async fn control_with_body(
    State(state): State<HttpState>,
    Json(body): Json<ControlBody>,
) -> Result<Json<Response>, ApiError> {
    forward(&state, &body.action, &body.data).await
}

async fn forward(
    state: &HttpState,
    action: &str,
    data: &ControlData,
) -> Result<Json<Response>, ApiError> {
    let control = Control::parse(action, data).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(Response::failure(e.to_string())),
        )
    })?;
    info!("HTTP API: {:?}", control);
    send(state, CoordinatorEvent::Control(control)).await?;
    Ok(Json(Response::ok()))
}

async fn send(state: &HttpState, event: CoordinatorEvent) -> Result<(), ApiError> {
    state.event_tx.send(event).await.map_err(|_| {
        error!("Failed to reach the coordinator");
        unavailable()
    })
}

fn unavailable() -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(Response::failure("coordinator unavailable")),
    )
}
