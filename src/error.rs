use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt::Display;

use crate::services::deployments::{ManagerError, PoolError};

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<AppError> for (StatusCode, String) {
    fn from(err: AppError) -> Self {
        (err.status, err.message)
    }
}

pub fn internal_error(err: impl Display) -> (StatusCode, String) {
    tracing::error!(error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

pub fn map_manager_error(err: ManagerError) -> (StatusCode, String) {
    let status = match &err {
        ManagerError::AlreadyRunning | ManagerError::RunActive => StatusCode::CONFLICT,
        ManagerError::InvalidPlan(_) | ManagerError::Pool(PoolError::DuplicateHost(_)) => {
            StatusCode::BAD_REQUEST
        }
        ManagerError::Pool(PoolError::Connect(_)) => StatusCode::BAD_GATEWAY,
        ManagerError::Pipeline(_) => return internal_error(err),
    };
    tracing::warn!(error = %err, status = %status, "deployment request rejected");
    (status, err.to_string())
}
