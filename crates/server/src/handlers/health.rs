use axum::{extract::State, Json};
use serde::Serialize;

use crate::appender::AppenderSnapshot;
use crate::config::AppState;
use crate::registry::PresenceSnapshot;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub appender: AppenderSnapshot,
    pub presence: PresenceSnapshot,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        appender: state.appender.snapshot(),
        presence: state.registry.snapshot(),
    })
}
