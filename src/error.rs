use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;

use crate::orgs::OrgError;
use crate::repo::StoreError;
use crate::uploads::UploadError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
    retry_after: Option<u64>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
            retry_after: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn invalid_credentials() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalid credentials")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message).with_code(code)
    }

    pub fn too_many_requests(retry_after_secs: u64) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "too many attempts, try again later",
        )
        .with_code("rate_limited");
        err.retry_after = Some(retry_after_secs.max(1));
        err
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> Option<&'static str> {
        self.code
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }

        let status = self.status;
        let retry_after = self.retry_after;
        let body = Json(ErrorResponse {
            error: self.message,
            code: self.code,
        });
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Database(diesel::result::Error::NotFound) => AppError::not_found(),
            StoreError::UniqueViolation(message) => {
                AppError::conflict("already_exists", message)
            }
            other => AppError::internal(other),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(value: UploadError) -> Self {
        let message = value.to_string();
        match value {
            UploadError::Validation(message) => AppError::bad_request(message),
            UploadError::NotFound => AppError::not_found(),
            UploadError::QuotaExceeded(_) => {
                AppError::forbidden(message).with_code("quota_exceeded")
            }
            UploadError::AlreadyFinalized => AppError::conflict("already_finalized", message),
            UploadError::NotReplaceable => AppError::conflict("not_replaceable", message),
            UploadError::NotReplacing => AppError::conflict("not_replacing", message),
            UploadError::StorageKeyMismatch => {
                AppError::conflict("storage_key_mismatch", message)
            }
            UploadError::NotYetVisible => AppError::conflict("not_yet_visible", message),
            UploadError::StorageUnavailable(_) => {
                AppError::conflict("storage_unavailable", message)
            }
            UploadError::Storage(_) | UploadError::Store(_) => AppError::internal(message),
        }
    }
}

impl From<OrgError> for AppError {
    fn from(value: OrgError) -> Self {
        match value {
            OrgError::Validation(message) => AppError::bad_request(message),
            OrgError::SlugTaken => AppError::conflict("slug_taken", "slug is already taken"),
            OrgError::Hash(err) => AppError::internal(err),
            OrgError::Store(err) => AppError::from(err),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}
