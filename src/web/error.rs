use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::server::command_dispatcher::DispatcherError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Node not connected: {0}")]
    NodeNotConnected(String),
    #[error("Node not bound: {0}")]
    NodeNotBound(String),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            // "Accepted but offline" must read as a failure to the caller.
            AppError::NodeNotConnected(msg) => {
                (StatusCode::CONFLICT, format!("Node not connected: {msg}"))
            }
            AppError::NodeNotBound(msg) => {
                (StatusCode::CONFLICT, format!("Node not bound: {msg}"))
            }
            AppError::StoreError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Store error: {msg}"),
            ),
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NodeNotFound(id) => AppError::NotFound(format!("Node {id}")),
            StoreError::Unavailable(msg) => AppError::StoreError(msg),
        }
    }
}

impl From<DispatcherError> for AppError {
    fn from(err: DispatcherError) -> Self {
        match err {
            DispatcherError::NodeNotFound(id) => AppError::NotFound(format!("Node {id}")),
            DispatcherError::NodeNotBound(id) => AppError::NodeNotBound(id),
            DispatcherError::NodeNotConnected(id) => AppError::NodeNotConnected(id),
            DispatcherError::Store(e) => e.into(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalServerError(format!("JSON serialization error: {err}"))
    }
}
