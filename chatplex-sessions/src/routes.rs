//! HTTP routes for the session lifecycle API.
//!
//! - `GET  /health`
//! - `POST /api/sessions/start | stop | logout`
//! - `GET  /api/sessions?all=true`, `GET /api/sessions/:name`
//! - `POST /api/sendText | sendImage | sendFile | sendVoice`
//! - `GET  /api/files/:filename` (stored media)

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::SessionError;
use crate::manager::{LogoutRequest, SessionManager, StartRequest, StopRequest};
use crate::message::{SendFileRequest, SendTextRequest};
use crate::session::SessionInfo;

// ============================================================================
// State
// ============================================================================

/// Shared state for the API server.
pub struct AppState {
    pub manager: Arc<SessionManager>,
    /// Folder served under `/api/files`
    pub files_folder: PathBuf,
}

pub fn create_state(manager: Arc<SessionManager>) -> Arc<AppState> {
    let files_folder = manager.settings().files.folder.clone();
    Arc::new(AppState {
        manager,
        files_folder,
    })
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SessionsQuery {
    #[serde(default)]
    all: bool,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if !self.is_client_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: self.code().to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, SessionError>;

// ============================================================================
// Health Routes
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "chatplex",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Session Routes
// ============================================================================

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> ApiResult<(StatusCode, Json<SessionInfo>)> {
    let info = state.manager.start(request).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn stop_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StopRequest>,
) -> ApiResult<Json<SuccessResponse>> {
    state.manager.stop(request).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn logout_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LogoutRequest>,
) -> ApiResult<Json<SuccessResponse>> {
    state.manager.logout(request).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> ApiResult<Json<Vec<SessionInfo>>> {
    Ok(Json(state.manager.get_sessions(query.all).await?))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    Ok(Json(state.manager.get_session_info(&name).await?))
}

// ============================================================================
// Chatting Routes
// ============================================================================

async fn send_text(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendTextRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = state.manager.get_session(&request.session)?;
    Ok(Json(session.send_text(&request.chat_id, &request.text).await?))
}

async fn send_image(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendFileRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = state.manager.get_session(&request.session)?;
    Ok(Json(session.send_image(&request).await?))
}

async fn send_file(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendFileRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = state.manager.get_session(&request.session)?;
    Ok(Json(session.send_file(&request).await?))
}

async fn send_voice(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendFileRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = state.manager.get_session(&request.session)?;
    Ok(Json(session.send_voice(&request).await?))
}

// ============================================================================
// Files
// ============================================================================

async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Response {
    // Single path segment only
    if filename.is_empty()
        || filename.starts_with('.')
        || filename.contains(['/', '\\', '\0'])
    {
        return StatusCode::NOT_FOUND.into_response();
    }

    let path = state.files_folder.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mimetype = mime_guess::from_path(&path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mimetype.to_string())], bytes).into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to read media file");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Build the API router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/start", post(start_session))
        .route("/api/sessions/stop", post(stop_session))
        .route("/api/sessions/logout", post(logout_session))
        .route("/api/sessions/:name", get(get_session))
        .route("/api/sendText", post(send_text))
        .route("/api/sendImage", post(send_image))
        .route("/api/sendFile", post(send_file))
        .route("/api/sendVoice", post(send_voice))
        .route("/api/files/:filename", get(get_file))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_error_response_shape() {
        let response = SessionError::SessionNotFound("alice".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = SessionError::InvalidAttachment("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = Router::new().route("/health", get(health));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
