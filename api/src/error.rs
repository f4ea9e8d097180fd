use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use essaylab_core::error::{self, ApiError};

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Resource missing or not visible to the caller (404)
    NotFound { resource: String },
    /// Caller may not act on this resource (403)
    Forbidden {
        message: String,
        docs_hint: Option<String>,
    },
    /// Unique constraint hit on a concurrent write (409)
    Conflict { message: String },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message: format!("{resource} not found"),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                },
            ),
            AppError::Forbidden { message, docs_hint } => (
                StatusCode::FORBIDDEN,
                ApiError {
                    error: error::codes::FORBIDDEN.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Conflict { message } => (
                StatusCode::CONFLICT,
                ApiError {
                    error: error::codes::CONFLICT.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: Some(
                        "A concurrent request already wrote this record. Re-read and retry if \
                         the state looks stale."
                            .to_string(),
                    ),
                },
            ),
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);

                // Unique constraint violations from concurrent writers are
                // conflicts, not internal failures.
                if let sqlx::Error::Database(ref db_err) = err {
                    if db_err.code().as_deref() == Some("23505") {
                        return AppError::Conflict {
                            message: "Record already exists".to_string(),
                        }
                        .into_response();
                    }
                }

                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}
