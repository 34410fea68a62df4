pub mod auth;
pub mod dashboard;
pub mod status;

use axum::middleware;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (no auth required) and **protected**
/// (gated behind the `RB_API_TOKEN` bearer-token middleware). The WebSocket
/// endpoint authenticates through the broker's verifier instead.
///
/// `state` is needed to wire up the auth middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/", get(dashboard::index))
        .route("/v1/health", get(status::health))
        .route("/api/status", get(status::status))
        .route("/v1/status", get(status::status))
        .route("/v1/ws", get(crate::ws::broker_ws));

    let protected = Router::new()
        .route("/v1/agents", get(status::list_agents))
        .route("/v1/sessions", get(status::list_sessions))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}
