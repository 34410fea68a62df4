use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use rb_broker::BROKER_VERSION;

use crate::state::AppState;

/// GET /v1/health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": BROKER_VERSION }))
}

/// GET /api/status, GET /v1/status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.broker.status())
}

/// GET /v1/agents
pub async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    let agents = state.broker.list_agents();
    Json(json!({ "count": agents.len(), "agents": agents }))
}

/// GET /v1/sessions
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.broker.sessions().list();
    Json(json!({ "count": sessions.len(), "sessions": sessions }))
}
