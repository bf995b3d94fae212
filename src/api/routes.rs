//! Route handlers for the agent-facing HTTP API.

use std::path::PathBuf;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::ApiState;
use crate::models::question::PendingQuestion;
use crate::AppError;

/// Prefix that turns a `/send` text into a question.
pub const ASK_PREFIX: &str = "/ask ";

/// Body of `POST /send`.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    /// Message text (markdown).
    pub text: String,
}

/// Body of `POST /ask`, also the JSON after `/ask ` in a send.
#[derive(Debug, Deserialize)]
pub struct AskRequest {
    /// Question prompt.
    pub question: String,
    /// Answer options.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Body of `POST /send_file`.
#[derive(Debug, Deserialize)]
pub struct SendFileRequest {
    /// Local file to upload.
    pub path: PathBuf,
    /// Optional caption.
    #[serde(default)]
    pub caption: Option<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    /// Always `ok` when the orchestrator answers.
    pub status: String,
    /// Whether a session id is stored.
    pub session_active: bool,
    /// Execution slot state.
    pub slot: String,
}

/// Error body: `{"error": "..."}` with a status derived from the error kind.
#[derive(Debug)]
pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(AppError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::Validation(_) | AppError::NotFound(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(err = %self.0, "api request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;

fn ok() -> ApiResult {
    Ok(Json(json!({ "ok": true })))
}

/// Parse the JSON after an `/ask ` prefix.
///
/// # Errors
///
/// Returns `AppError::Validation` when the JSON is malformed or the
/// question is invalid.
pub fn parse_ask_text(rest: &str) -> crate::Result<PendingQuestion> {
    let request: AskRequest = serde_json::from_str(rest.trim())
        .map_err(|err| AppError::Validation(format!("invalid /ask payload: {err}")))?;
    PendingQuestion::new(request.question, request.options)
}

/// `GET /health`
pub async fn health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, ApiError> {
    let snapshot = state.orchestrator.status(None).await?;
    Ok(Json(HealthResponse {
        status: "ok".into(),
        session_active: snapshot.session_id.is_some(),
        slot: snapshot.slot.into(),
    }))
}

/// `POST /send`
pub async fn send(
    State(state): State<ApiState>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    if let Some(rest) = request.text.strip_prefix(ASK_PREFIX) {
        let question = parse_ask_text(rest)?;
        info!(options = question.options.len(), "question received via send");
        state.orchestrator.ask(question).await?;
        return ok();
    }
    if request.text.trim().is_empty() {
        return Err(AppError::Validation("text must not be empty".into()).into());
    }
    state.orchestrator.send_outbound(request.text).await?;
    ok()
}

/// `POST /ask`
pub async fn ask(
    State(state): State<ApiState>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let question = PendingQuestion::new(request.question, request.options)?;
    info!(options = question.options.len(), "question received");
    state.orchestrator.ask(question).await?;
    ok()
}

/// `POST /send_file`
pub async fn send_file(
    State(state): State<ApiState>,
    body: Result<Json<SendFileRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let is_file = tokio::fs::metadata(&request.path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(AppError::NotFound(format!(
            "no such file: {}",
            request.path.display()
        ))
        .into());
    }
    let caption = request.caption.filter(|caption| !caption.trim().is_empty());
    state.orchestrator.send_file(request.path, caption).await?;
    ok()
}
