//! Route handler functions for all API endpoints.
//!
//! Handlers validate transport-level input, delegate to the orchestrator,
//! and return JSON.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use prodlens_chat::{QueryResponse, SessionSummary};
use prodlens_core::types::HistoryEntry;

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Request and response types
// =============================================================================

/// Request body for POST /query.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Request body for POST /conversations. The body itself is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NewConversationRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewConversationResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub messages: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /health - health check.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// POST /query - answer one message.
pub async fn query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let response = state
        .orchestrator
        .query(&request.message, request.session_id.as_deref())
        .await?;
    Ok(Json(response))
}

/// POST /conversations - start (or reset) a conversation.
pub async fn new_conversation(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<NewConversationResponse>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        NewConversationRequest::default()
    } else {
        serde_json::from_slice::<NewConversationRequest>(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)))?
    };
    let session_id = state
        .orchestrator
        .new_conversation(request.session_id.as_deref())
        .await?;
    Ok(Json(NewConversationResponse {
        session_id: session_id.to_string(),
    }))
}

/// GET /conversations - stored sessions, most recently active first.
pub async fn list_conversations(
    State(state): State<AppState>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let sessions = state.orchestrator.list_conversations().await?;
    Ok(Json(SessionsResponse { sessions }))
}

/// DELETE /conversations/{id} - drop a session and its history.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.orchestrator.delete_conversation(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no session {}", id)))
    }
}

/// GET /conversations/{id}/history - full stored history, oldest first.
pub async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let messages = state.orchestrator.history(&id).await?;
    Ok(Json(HistoryResponse {
        session_id: id,
        messages,
    }))
}

/// GET /graph - Mermaid source of the turn state machine.
pub async fn graph(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.orchestrator.graph_mermaid(),
    )
}

pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("no route for {}", uri.path()))
}
