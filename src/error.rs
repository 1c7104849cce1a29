use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MultigrainError {
    #[error("Invalid registration: {0}")]
    Registration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to publish message: {0}")]
    Publish(String),

    #[error("Failed to subscribe: {0}")]
    Subscribe(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("Queue broker error: {0}")]
    Broker(String),

    #[error("Record handler failed: {0}")]
    Handler(String),

    #[error("Status probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Worker {worker} rejected request with status {status}")]
    WorkerRejected { worker: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MultigrainError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub error: String,
}

impl MultigrainError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MultigrainError::Registration(_)
            | MultigrainError::InvalidMessage(_)
            | MultigrainError::Settings(_) => StatusCode::BAD_REQUEST,
            MultigrainError::NotFound(_) => StatusCode::NOT_FOUND,
            MultigrainError::ProbeTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            MultigrainError::WorkerRejected { .. } | MultigrainError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for MultigrainError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorResponse {
            status: status.as_u16(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
