//! HTTP and WebSocket surface of the relay.

pub mod groups;
pub mod health;
pub mod history;
pub mod ws;

use axum::{
    routing::{get, put},
    Router,
};

// Re-export AppState from config
pub use crate::config::AppState;

pub use groups::seed_group;
pub use health::health_check;
pub use history::{direct_history, group_history};
pub use ws::{direct_ws, group_ws};

/// Build the relay's router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Live connections
        .route("/ws", get(direct_ws))
        .route("/group/ws", get(group_ws))
        // History
        .route("/history", get(direct_history))
        .route("/group/history", get(group_history))
        // Group metadata
        .route("/group/{group_id}/members", put(seed_group))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
