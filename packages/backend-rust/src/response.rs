use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use ebars_algo::EbarsError;

use crate::services::ebars::ServiceError;
use crate::store::StoreError;

#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    is_operational: bool,
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::operational(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::operational(StatusCode::CONFLICT, code, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::operational(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
            is_operational: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    fn operational(
        status: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            is_operational: true,
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Core(core) => match core {
                EbarsError::InvalidEmoji(_) => {
                    json_error(StatusCode::BAD_REQUEST, "INVALID_EMOJI", core.to_string())
                }
                EbarsError::AlreadyCompleted => {
                    Self::conflict("ALREADY_COMPLETED", core.to_string())
                }
                EbarsError::InvalidScore(_)
                | EbarsError::InvalidKey(_)
                | EbarsError::MalformedSubmission(_)
                | EbarsError::EmptyContent => Self::validation(core.to_string()),
                EbarsError::InvalidConfig(_) | EbarsError::Interchange(_) => {
                    tracing::error!(error = %core, "unexpected core error");
                    Self::internal(core.to_string())
                }
            },
            ServiceError::NoPendingTest => Self::not_found(ServiceError::NoPendingTest.to_string()),
            ServiceError::Store(StoreError::Stale(reason)) => {
                tracing::warn!(%reason, "write lost to a concurrent update");
                Self::conflict("CONFLICT", "state changed concurrently, please retry")
            }
            ServiceError::Store(store) => {
                tracing::error!(error = %store, "store failure");
                Self::internal(store.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = if self.is_operational {
            self.message
        } else {
            "Internal server error".to_string()
        };

        let body = ErrorResponse {
            success: false,
            error: message,
            code: self.code,
        };

        (self.status, Json(body)).into_response()
    }
}

pub fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> AppError {
    AppError {
        status,
        code: code.into(),
        message: message.into(),
        is_operational: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_mapping() {
        let cases = [
            (
                ServiceError::Core(EbarsError::InvalidEmoji("x".into())),
                StatusCode::BAD_REQUEST,
                "INVALID_EMOJI",
            ),
            (
                ServiceError::Core(EbarsError::AlreadyCompleted),
                StatusCode::CONFLICT,
                "ALREADY_COMPLETED",
            ),
            (
                ServiceError::Core(EbarsError::EmptyContent),
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
            ),
            (ServiceError::NoPendingTest, StatusCode::NOT_FOUND, "NOT_FOUND"),
            (
                ServiceError::Store(StoreError::Stale("moved on".into())),
                StatusCode::CONFLICT,
                "CONFLICT",
            ),
            (
                ServiceError::Store(StoreError::Corrupt("bad row".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
            ),
        ];
        for (err, status, code) in cases {
            let app: AppError = err.into();
            assert_eq!(app.status(), status);
            assert_eq!(app.code(), code);
        }
    }

    #[test]
    fn test_internal_message_hidden() {
        let app: AppError = ServiceError::Store(StoreError::Corrupt("secret".into())).into();
        assert!(!app.is_operational);
    }
}
