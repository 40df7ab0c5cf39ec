use am_core::ManagerError;
use am_storage::StorageError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("{0}")]
    Unauthorized(String),
    #[error("worker failed: {0}")]
    Worker(String),
}

impl From<StorageError> for HubError {
    fn from(err: StorageError) -> Self {
        HubError::Manager(err.into())
    }
}

impl From<tokio::task::JoinError> for HubError {
    fn from(err: tokio::task::JoinError) -> Self {
        HubError::Worker(err.to_string())
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let (status, payload) = match &self {
            HubError::Manager(err) => (err.status_code(), err.payload()),
            HubError::Unauthorized(message) => (
                401,
                json!({"rest": {"error": message, "status": 401, "class": "unauthorized"}}),
            ),
            HubError::Worker(message) => {
                error!(event = "worker_failed", error = %message);
                let err = ManagerError::store("request could not be completed");
                (err.status_code(), err.payload())
            }
        };
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(payload)).into_response()
    }
}
