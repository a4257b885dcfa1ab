// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the API server.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use instancer_orchestrator::OrchestratorError;

/// API errors, mapped to structured JSON error responses.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    /// Request target does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request is missing a required field or carries an invalid one.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Missing or invalid credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A cluster API call failed.
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// The cluster client could not be initialized; the service cannot
    /// manage instances at all right now.
    #[error("Service unavailable")]
    ServiceUnavailable,

    /// Session store operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::NotFound(id) => ApiError::NotFound(format!("instance {id}")),
            OrchestratorError::ClientUnavailable(_) => ApiError::ServiceUnavailable,
            OrchestratorError::Provisioning(msg) => ApiError::Provisioning(msg),
            other => ApiError::Provisioning(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Provisioning(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            // Fixed body: the caller learns nothing about why the cluster
            // client is missing.
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service unavailable".to_string(),
            ),
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Result type using ApiError.
pub type Result<T> = std::result::Result<T, ApiError>;
