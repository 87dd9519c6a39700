use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("instance {0} has no registered speed node")]
    NotRegistered(String),

    #[error("upstream call failed: {0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for ServerError {
    fn from(e: reqwest::Error) -> Self {
        ServerError::Upstream(e.to_string())
    }
}

impl ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServerError::InvalidParam(_) | ServerError::PreconditionFailed(_) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::NotRegistered(_) => StatusCode::BAD_REQUEST,
            ServerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServerError::Db(_) | ServerError::Io(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Storage-level detail stays in the logs, not on the wire.
        let msg = match &self {
            ServerError::Db(e) => {
                tracing::error!("database error: {e}");
                "internal error".to_string()
            }
            ServerError::Io(e) => {
                tracing::error!("io error: {e}");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({ "code": status.as_u16(), "msg": msg }));
        (status, body).into_response()
    }
}

impl From<ServerError> for tonic::Status {
    fn from(e: ServerError) -> Self {
        match &e {
            ServerError::InvalidParam(_) => tonic::Status::invalid_argument(e.to_string()),
            ServerError::PreconditionFailed(_) => {
                tonic::Status::failed_precondition(e.to_string())
            }
            ServerError::NotFound(_) => tonic::Status::not_found(e.to_string()),
            ServerError::Conflict(_) => tonic::Status::already_exists(e.to_string()),
            ServerError::NotRegistered(_) => tonic::Status::failed_precondition(e.to_string()),
            ServerError::Upstream(_) => tonic::Status::unavailable(e.to_string()),
            ServerError::Db(err) => {
                tracing::error!("database error: {err}");
                tonic::Status::internal("internal error")
            }
            ServerError::Io(_) | ServerError::Internal(_) => {
                tonic::Status::internal(e.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
