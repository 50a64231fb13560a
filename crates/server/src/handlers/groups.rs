use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::ws::required;
use crate::config::AppState;
use crate::error::{ApiError, Result};
use crate::models::ConversationKey;

#[derive(Debug, Deserialize)]
pub struct SeedGroupRequest {
    pub members: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct GroupMembers {
    pub group_id: String,
    pub members: Vec<String>,
}

/// PUT /group/{group_id}/members
///
/// Creates the group conversation if it does not exist yet and adds the
/// listed users to its persisted member list. Does not affect live routing.
pub async fn seed_group(
    Path(group_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<SeedGroupRequest>,
) -> Result<Json<GroupMembers>> {
    let group_id = required("group_id", group_id)?;
    let members: Vec<String> = request
        .members
        .into_iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
    if members.is_empty() {
        return Err(ApiError::BadRequest("members must not be empty".to_string()));
    }
    info!("PUT /group/{}/members ({} members)", group_id, members.len());

    state.store.seed_group(&group_id, &members).await?;
    let members = state
        .store
        .members(&ConversationKey::group(group_id.as_str()))
        .await?;

    Ok(Json(GroupMembers { group_id, members }))
}
