//! HTTP control surface over the relay core.
//!
//! Thin by intent: every handler resolves IDs, delegates to the core and
//! maps the core error onto a status code. No business rules live here.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courtfeed::encoder::EncoderSupervisor;
use courtfeed::{RecordingOrchestrator, RelayConfig, RelayError, SessionManager};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub sessions: Arc<SessionManager>,
    pub recordings: Arc<RecordingOrchestrator>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let config = Arc::new(config);
        let supervisor = Arc::new(EncoderSupervisor::new());
        let sessions = Arc::new(SessionManager::new(config.clone(), supervisor.clone()));
        let recordings = Arc::new(RecordingOrchestrator::new(config.clone(), supervisor));
        sessions.set_recording_guard(recordings.clone());
        Self {
            config,
            sessions,
            recordings,
        }
    }
}

/// Uniform error body: `{"error": "..."}`.
fn error_response(err: RelayError) -> Response {
    let status = match &err {
        RelayError::CapacityExceeded { .. } | RelayError::NoFreePort { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RelayError::AlreadyRecording { .. } | RelayError::RecordingInProgress { .. } => {
            StatusCode::CONFLICT
        }
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::SourceUnavailable { .. } | RelayError::Spawn { .. } => {
            StatusCode::BAD_GATEWAY
        }
        RelayError::Bind { .. } | RelayError::Probe(_) | RelayError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::error!("request failed: {err}");
    } else {
        tracing::warn!("request rejected: {err}");
    }
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub camera_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeSourceRequest {
    pub camera_url: String,
}

#[derive(Debug, Deserialize)]
pub struct StartRecordingRequest {
    pub court_id: u32,
    pub user_id: Option<String>,
    #[serde(rename = "duration_seconds")]
    pub duration_secs: u32,
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ClosedResponse {
    court_id: u32,
    closed: bool,
}

async fn create_session(
    State(state): State<AppState>,
    Path(court_id): Path<u32>,
    body: Option<Json<CreateSessionRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    match state
        .sessions
        .create_session(court_id, request.camera_url.as_deref())
        .await
    {
        Ok(info) => (StatusCode::CREATED, Json(info)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_sessions(State(state): State<AppState>) -> Response {
    Json(state.sessions.list_sessions()).into_response()
}

async fn get_session(State(state): State<AppState>, Path(court_id): Path<u32>) -> Response {
    match state.sessions.get_session(court_id) {
        Some(info) => Json(info).into_response(),
        None => error_response(RelayError::NotFound(format!("session for court {court_id}"))),
    }
}

async fn session_stream(State(state): State<AppState>, Path(court_id): Path<u32>) -> Response {
    match state.sessions.stream_response(court_id) {
        Some(response) => response,
        None => error_response(RelayError::NotFound(format!("session for court {court_id}"))),
    }
}

async fn session_health(State(state): State<AppState>, Path(court_id): Path<u32>) -> Response {
    match state.sessions.health(court_id) {
        Some(health) => Json(health).into_response(),
        None => error_response(RelayError::NotFound(format!("session for court {court_id}"))),
    }
}

async fn change_source(
    State(state): State<AppState>,
    Path(court_id): Path<u32>,
    Json(request): Json<ChangeSourceRequest>,
) -> Response {
    match state
        .sessions
        .change_camera_source(court_id, request.camera_url)
        .await
    {
        Ok(info) => Json(info).into_response(),
        Err(err) => error_response(err),
    }
}

async fn close_session(State(state): State<AppState>, Path(court_id): Path<u32>) -> Response {
    let closed = state.sessions.close_session(court_id).await;
    Json(ClosedResponse { court_id, closed }).into_response()
}

async fn start_recording(
    State(state): State<AppState>,
    Json(request): Json<StartRecordingRequest>,
) -> Response {
    // Record off the local relay when a session is live; otherwise go to the
    // camera directly.
    let source = state
        .sessions
        .local_stream_url(request.court_id)
        .or_else(|| state.sessions.camera_url(request.court_id, None));
    let Some(source) = source else {
        return error_response(RelayError::SourceUnavailable {
            court_id: request.court_id,
        });
    };

    match state
        .recordings
        .start(
            request.court_id,
            request.user_id,
            &source,
            request.duration_secs,
            request.output_path,
        )
        .await
    {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_recordings(State(state): State<AppState>) -> Response {
    Json(state.recordings.status_all()).into_response()
}

async fn recording_status(
    State(state): State<AppState>,
    Path(recording_id): Path<String>,
) -> Response {
    match state.recordings.status(&recording_id) {
        Some(task) => Json(task).into_response(),
        None => error_response(RelayError::NotFound(format!("recording {recording_id}"))),
    }
}

async fn stop_recording(
    State(state): State<AppState>,
    Path(recording_id): Path<String>,
) -> Response {
    match state.recordings.stop(&recording_id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => error_response(err),
    }
}

async fn service_health(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.session_count(),
        "recordings_active": state.recordings.active_count(),
    }))
    .into_response()
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(service_health))
        .route("/sessions", get(list_sessions))
        .route(
            "/sessions/:court_id",
            post(create_session).get(get_session).delete(close_session),
        )
        .route("/sessions/:court_id/stream", get(session_stream))
        .route("/sessions/:court_id/health", get(session_health))
        .route("/sessions/:court_id/source", post(change_source))
        .route("/recordings", post(start_recording).get(list_recordings))
        .route("/recordings/:recording_id/status", get(recording_status))
        .route("/recordings/:recording_id/stop", post(stop_recording))
        .with_state(state)
}

/// Serve until ctrl-c, then close every session and stop every recording.
pub async fn run_server(state: AppState, bind: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("control surface listening on {bind}");

    // Periodic sweep for encoder children that died without a stop call.
    let recordings = state.recordings.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            recordings.cleanup_zombies().await;
        }
    });

    let sessions = state.sessions.clone();
    let recordings = state.recordings.clone();
    let router = create_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    recordings.stop_all().await;
    sessions.close_all().await;
    Ok(())
}
