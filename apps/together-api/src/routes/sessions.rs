use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use together_common::id::new_session_id;

use crate::error::{ApiError, FieldError};
use crate::models::session::SessionRecord;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{session_id}", get(get_session).delete(delete_session))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub name: String,
    #[serde(default)]
    pub base_location: String,
    #[serde(default)]
    pub creator: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub id: String,
    pub join_url: String,
    pub name: String,
    pub base_url: String,
    pub creator_identifier: String,
}

impl SessionResponse {
    fn new(record: SessionRecord, ws_base: &str) -> Self {
        Self {
            join_url: record.join_url(ws_base),
            id: record.id,
            name: record.name,
            base_url: record.base_location,
            creator_identifier: record.creator,
        }
    }
}

const MAX_NAME_LEN: usize = 100;

fn validate(body: &CreateSessionRequest) -> Result<(), ApiError> {
    let mut errors = Vec::new();
    let name = body.name.trim();
    if name.is_empty() {
        errors.push(FieldError {
            field: "name".to_string(),
            message: "must not be empty".to_string(),
        });
    } else if name.chars().count() > MAX_NAME_LEN {
        errors.push(FieldError {
            field: "name".to_string(),
            message: format!("must be at most {MAX_NAME_LEN} characters"),
        });
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::validation(errors))
    }
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    validate(&body)?;

    let record = SessionRecord::new(
        new_session_id(),
        body.name.trim().to_string(),
        body.creator,
        body.base_location,
    );
    state.directory.store(&record).await?;

    tracing::info!(session_id = %record.id, name = %record.name, "session created");

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse::new(record, &state.config.public_ws_base)),
    ))
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    let ws_base = &state.config.public_ws_base;
    let sessions = state
        .directory
        .list()
        .await?
        .into_iter()
        .map(|record| SessionResponse::new(record, ws_base))
        .collect();
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let record = state
        .directory
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    Ok(Json(SessionResponse::new(record, &state.config.public_ws_base)))
}

/// Remove the session and disconnect everyone in it, on every replica.
async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.directory.delete(&session_id).await? {
        return Err(ApiError::not_found("Session not found"));
    }
    state.registry.close_session(&session_id).await;
    Ok(StatusCode::NO_CONTENT)
}
