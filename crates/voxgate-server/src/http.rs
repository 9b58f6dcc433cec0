//! HTTP action and debug handlers.
//!
//! Routes and JSON keys are camelCase; snake_case request keys are still
//! accepted through serde aliases for older consumers. Action failures map to
//! status codes by kind: validation 400, precondition 409, upstream down 503,
//! body `{error, message}`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use voxgate_core::events::DialogueSource;
use voxgate_core::ids::{CharacterId, ClientId, MessageId};
use voxgate_core::state::StateSnapshot;
use voxgate_core::ActionError;

use crate::server::AppState;

pub struct ApiError(ActionError);

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ActionError::Validation(_) => StatusCode::BAD_REQUEST,
            ActionError::PreconditionFailed(_) => StatusCode::CONFLICT,
            ActionError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

fn ok() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogueRequest {
    pub text: String,
    #[serde(default = "default_source")]
    pub source: DialogueSource,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, alias = "immediate_reply")]
    pub immediate_reply: Option<bool>,
}

fn default_source() -> DialogueSource {
    DialogueSource::User
}

#[derive(Deserialize)]
pub struct ContextRequest {
    pub key: String,
    pub content: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct ExternalSpeakerStartRequest {
    pub source: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSpeakerStopRequest {
    #[serde(default = "default_true", alias = "trigger_response")]
    pub trigger_response: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsPlaybackRequest {
    #[serde(alias = "character_id")]
    pub character_id: CharacterId,
    #[serde(default, alias = "message_id")]
    pub message_id: Option<MessageId>,
}

pub async fn health(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "voxtaConnected": app.state.connected(),
    }))
}

pub async fn state(State(app): State<AppState>) -> Json<StateSnapshot> {
    Json(app.state.snapshot())
}

pub async fn dialogue(
    State(app): State<AppState>,
    Json(req): Json<DialogueRequest>,
) -> Result<Json<Value>, ApiError> {
    app.gateway
        .send_dialogue(req.text, req.source, req.author, req.immediate_reply)
        .await?;
    Ok(ok())
}

pub async fn context(
    State(app): State<AppState>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<Value>, ApiError> {
    app.gateway
        .send_context(req.key, req.content, req.description)
        .await?;
    Ok(ok())
}

pub async fn external_speaker_start(
    State(app): State<AppState>,
    Json(req): Json<ExternalSpeakerStartRequest>,
) -> Result<Json<Value>, ApiError> {
    app.gateway
        .external_speaker_start(req.source, req.reason)
        .await?;
    Ok(ok())
}

pub async fn external_speaker_stop(
    State(app): State<AppState>,
    Json(req): Json<ExternalSpeakerStopRequest>,
) -> Result<Json<Value>, ApiError> {
    app.gateway.external_speaker_stop(req.trigger_response).await?;
    Ok(ok())
}

pub async fn tts_playback_start(
    State(app): State<AppState>,
    Json(req): Json<TtsPlaybackRequest>,
) -> Result<Json<Value>, ApiError> {
    app.gateway
        .tts_playback_start(req.character_id, req.message_id)
        .await?;
    Ok(ok())
}

pub async fn tts_playback_complete(
    State(app): State<AppState>,
    Json(req): Json<TtsPlaybackRequest>,
) -> Result<Json<Value>, ApiError> {
    app.gateway
        .tts_playback_complete(req.character_id, req.message_id)
        .await?;
    Ok(ok())
}

pub async fn debug_clients(State(app): State<AppState>) -> Json<Value> {
    let clients = app.registry.describe();
    Json(json!({
        "count": clients.len(),
        "clients": clients,
    }))
}

pub async fn debug_client_history(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let id = ClientId::from_raw(id);
    match app.registry.history_of(&id) {
        Some(history) => Ok(Json(json!({
            "clientId": id,
            "count": history.len(),
            "history": history,
        }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub async fn debug_upstream_history(State(app): State<AppState>) -> Json<Value> {
    let history = app.bridge.history();
    Json(json!({
        "count": history.len(),
        "history": history,
    }))
}
