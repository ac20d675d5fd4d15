use crate::core::CoreHandle;
use crate::state::StateBoard;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use busy_proto::error::BusyError;
use busy_proto::protocol::{DaemonState, Request};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct HttpState {
    board: StateBoard,
    core: CoreHandle,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

type ApiResult = Result<Json<DaemonState>, (StatusCode, Json<ApiError>)>;

pub fn router(board: StateBoard, core: CoreHandle) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/request", post(request))
        .route("/api/settings", post(settings_update))
        .route("/api/channels/:id/start", get(start_channel).post(start_channel))
        .route("/api/channels/:id/stop", get(stop_channel).post(stop_channel))
        .route("/api/stop-all", get(stop_all).post(stop_all))
        .route("/api/start-all", get(start_all).post(start_all))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { board, core })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    board: StateBoard,
    core: CoreHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(board, core);

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

fn status_for(e: &BusyError) -> StatusCode {
    match e {
        BusyError::Validation(_) => StatusCode::BAD_REQUEST,
        BusyError::NotFound(_) => StatusCode::NOT_FOUND,
        BusyError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        BusyError::CoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Apply `request` and answer with the state it produced.
async fn run(state: &HttpState, request: Request) -> ApiResult {
    match state.core.request(request).await {
        Ok(()) => Ok(Json(state.board.get_state().await)),
        Err(e) => {
            warn!("HTTP API: request failed: {}", e);
            Err((status_for(&e), Json(ApiError { error: e.to_string() })))
        }
    }
}

async fn get_state(State(state): State<HttpState>) -> Json<DaemonState> {
    Json(state.board.get_state().await)
}

async fn request(State(state): State<HttpState>, Json(request): Json<Request>) -> ApiResult {
    info!("HTTP API: {:?}", request);
    run(&state, request).await
}

async fn settings_update(State(state): State<HttpState>, Json(payload): Json<Value>) -> ApiResult {
    info!("HTTP API: settings update");
    run(&state, Request::SettingsUpdate { payload }).await
}

async fn start_channel(State(state): State<HttpState>, Path(id): Path<String>) -> ApiResult {
    info!("HTTP API: start {}", id);
    let request = Request::PlaySound {
        app_id: id,
        sound_file: None,
        interval: None,
        volume: None,
    };
    run(&state, request).await
}

async fn stop_channel(State(state): State<HttpState>, Path(id): Path<String>) -> ApiResult {
    info!("HTTP API: stop {}", id);
    run(&state, Request::StopSound { app_id: id }).await
}

async fn stop_all(State(state): State<HttpState>) -> ApiResult {
    info!("HTTP API: stop all");
    run(&state, Request::StopAll).await
}

async fn start_all(State(state): State<HttpState>) -> ApiResult {
    info!("HTTP API: start all");
    run(&state, Request::StartAll).await
}
