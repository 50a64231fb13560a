use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use tracing::info;

use super::ws::required;
use crate::config::AppState;
use crate::error::Result;
use crate::models::Message;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DirectHistoryParams {
    pub user1: String,
    pub user2: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GroupHistoryParams {
    pub group_id: String,
}

/// GET /history?user1=&user2=
pub async fn direct_history(
    Query(params): Query<DirectHistoryParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Message>>> {
    let user1 = required("user1", params.user1)?;
    let user2 = required("user2", params.user2)?;
    info!("GET /history {} <-> {}", user1, user2);

    let messages = state.history.direct(&user1, &user2).await?;
    Ok(Json(messages))
}

/// GET /group/history?group_id=
pub async fn group_history(
    Query(params): Query<GroupHistoryParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Message>>> {
    let group = required("group_id", params.group_id)?;
    info!("GET /group/history {}", group);

    let messages = state.history.group(&group).await?;
    Ok(Json(messages))
}
