//! HTTP/WebSocket surface: top-level router wiring.

pub mod agent_ws;
pub mod bridge_ws;
pub mod poll;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::AppState;

pub fn make_router(state: AppState) -> Router {
    Router::new()
        .route("/agent/ws", get(agent_ws::handler))
        .route("/bridge/ws", get(bridge_ws::handler))
        .merge(poll::make_router(state.clone()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
