//! REST API endpoints for the export server
//!
//! All endpoints are under /api/v1/, return JSON and require the same
//! `security-phrase` header as the WebSocket handshake.

use crate::clients::ClientStatus;
use crate::stream::PlaybackState;
use crate::ws::has_credential;
use crate::{AppState, ServerInfo, ServerStatus};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use serde::Deserialize;

type ApiError = (StatusCode, String);

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if has_credential(state, headers) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            crate::RejectReason::Credential.to_string(),
        ))
    }
}

/// Playback control request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub action: StreamAction,
    /// Recording to play back; keeps the current one when absent
    pub recording_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamAction {
    Start,
    Pause,
    Stop,
}

/// GET /api/v1/status
pub async fn get_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ServerStatus>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.status()))
}

/// GET /api/v1/info
pub async fn get_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ServerInfo>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.info()))
}

/// GET /api/v1/clients
pub async fn get_clients(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ClientStatus>>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.clients()))
}

/// POST /api/v1/stream
pub async fn control_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StreamRequest>,
) -> Result<Json<ServerStatus>, ApiError> {
    authorize(&state, &headers)?;

    if let Some(recording_id) = req.recording_id {
        if state.playback() == PlaybackState::Streaming {
            return Err((
                StatusCode::CONFLICT,
                "Cannot change recording while streaming".to_string(),
            ));
        }
        state.select_recording(recording_id);
    }

    match req.action {
        StreamAction::Start => state
            .start_stream()
            .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?,
        StreamAction::Pause => state.pause_stream(),
        StreamAction::Stop => state.stop_stream(),
    }
    Ok(Json(state.status()))
}
