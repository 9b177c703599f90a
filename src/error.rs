use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

use crate::crawler::CrawlError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BadRequest".to_string(), msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NotFound".to_string(), msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "Upstream".to_string(), msg),
            AppError::Internal(err) => {
                tracing::error!(error = ?err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal".to_string(),
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorBody {
            error: message,
            code,
        });

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(err.into())
    }
}

impl From<CrawlError> for AppError {
    fn from(err: CrawlError) -> Self {
        match err {
            CrawlError::UnknownSource(_) => AppError::NotFound(err.to_string()),
            CrawlError::SessionInvalid(_) => AppError::BadRequest(err.to_string()),
            CrawlError::ListUnavailable { .. }
            | CrawlError::ArticleUnavailable(_)
            | CrawlError::ArticleDeleted(_) => AppError::Upstream(err.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
