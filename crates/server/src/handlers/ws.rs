//! WebSocket endpoints for direct and group chat.
//!
//! Each connection gets one writer task draining its outbound queue into the
//! socket, while the upgrade task reads frames and routes them.

use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::AppState;
use crate::error::{ApiError, FrameError, Result};
use crate::session::{Identity, Session};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DirectParams {
    pub user_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GroupParams {
    pub group_id: String,
    pub user_id: String,
}

pub(crate) fn required(name: &str, value: String) -> Result<String> {
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(ApiError::BadRequest(format!("{} is required", name)));
    }
    Ok(value)
}

/// GET /ws?user_id=
pub async fn direct_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<DirectParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let user = required("user_id", params.user_id)?;
    let identity = Identity::Direct { user };
    Ok(ws.on_upgrade(move |socket| run_connection(socket, identity, state)))
}

/// GET /group/ws?group_id=&user_id=
pub async fn group_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<GroupParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let group = required("group_id", params.group_id)?;
    let user = required("user_id", params.user_id)?;
    let identity = Identity::Group { group, user };
    Ok(ws.on_upgrade(move |socket| run_connection(socket, identity, state)))
}

async fn run_connection(socket: WebSocket, identity: Identity, state: AppState) {
    let mut session = Session::new(identity);
    let mut outbound = session.open(&state.registry);
    let (mut sink, mut stream) = socket.split();

    let registry = state.registry.clone();
    let key = session.key().clone();
    let id = session.id();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode message for {}: {}", key, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(WsFrame::Text(text.into())).await {
                debug!("Write to {} failed: {}", key, e);
                registry.release(&key, id);
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(WsFrame::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(WsFrame::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping frame from {}: {}", session.key(), FrameError::NotUtf8);
                            continue;
                        }
                    },
                    Some(Ok(WsFrame::Ping(_))) | Some(Ok(WsFrame::Pong(_))) => continue,
                    Some(Ok(WsFrame::Close(_))) | None => {
                        session.begin_close("client closed");
                        break;
                    }
                    Some(Err(e)) => {
                        session.begin_close(&format!("read error: {}", e));
                        break;
                    }
                };

                match session.receive(&text, &state.router) {
                    Ok(outcome) => debug!(
                        "Routed frame from {}: {} delivered, {} failed",
                        session.key(),
                        outcome.delivered,
                        outcome.failed
                    ),
                    Err(e) => warn!("Dropping frame from {}: {}", session.key(), e),
                }
            }
            _ = &mut writer => {
                session.begin_close("writer stopped");
                break;
            }
        }
    }

    session.close(&state.registry);
    writer.abort();
}
