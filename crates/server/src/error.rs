use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::registry::ConnectionId;

/// Why an inbound frame was rejected at the framing boundary.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not a valid message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
    #[error("frame has no sender")]
    MissingSender,
    #[error("frame names neither a recipient nor a group")]
    MissingTarget,
    #[error("frame names both a recipient and a group")]
    AmbiguousTarget,
    #[error("frame sender {claimed:?} does not match connection user {actual:?}")]
    SenderMismatch { claimed: String, actual: String },
    #[error("frame for group {claimed:?} sent on a connection for group {actual:?}")]
    GroupMismatch { claimed: String, actual: String },
    #[error("direct frame sent on a group connection")]
    DirectOnGroupConnection,
    #[error("group frame sent on a direct connection")]
    GroupOnDirectConnection,
}

/// Live forward to a connection failed.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    #[error("connection {0} is not reading, outbound queue full")]
    Full(ConnectionId),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt message row in {conversation}: {source}")]
    Corrupt {
        conversation: String,
        #[source]
        source: FrameError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = core::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Store(err) => {
                tracing::error!("Store failure while serving request: {}", err);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "conversation store unavailable".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": error_message
            }
        }));

        (status, body).into_response()
    }
}
