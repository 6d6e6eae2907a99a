use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use portico_driver_api::{DriverError, ErrorKind};
use portico_engine::TooManyJobs;
use portico_vfs::{BasicPathDenied, IndexNotReady, PasswordRequired};

/// API failure carrying the envelope the wire contract mandates:
/// `{code, message, success: false}` where `code` mirrors the HTTP status.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GONE, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput | ErrorKind::Unsupported => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthenticated | ErrorKind::SignatureExpired => StatusCode::UNAUTHORIZED,
        ErrorKind::PermissionDenied | ErrorKind::ReadOnly => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Gone | ErrorKind::SessionExpired => StatusCode::GONE,
        ErrorKind::QuotaExceeded => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::UpstreamTransient | ErrorKind::UpstreamFatal => StatusCode::BAD_GATEWAY,
        ErrorKind::Cancelled => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn classify(error: &anyhow::Error) -> Option<AppError> {
    for cause in error.chain() {
        if let Some(driver) = cause.downcast_ref::<DriverError>() {
            return Some(AppError::new(
                status_for_kind(driver.kind()),
                driver.message().to_string(),
            ));
        }
        if let Some(denied) = cause.downcast_ref::<BasicPathDenied>() {
            return Some(AppError::forbidden(denied.to_string()));
        }
        if let Some(password) = cause.downcast_ref::<PasswordRequired>() {
            return Some(AppError::unauthorized(password.to_string()));
        }
        if let Some(index) = cause.downcast_ref::<IndexNotReady>() {
            return Some(AppError::conflict(index.to_string()));
        }
        if let Some(jobs) = cause.downcast_ref::<TooManyJobs>() {
            return Some(AppError::new(
                StatusCode::TOO_MANY_REQUESTS,
                jobs.to_string(),
            ));
        }
        if let Some(sqlx_error) = cause.downcast_ref::<sqlx::Error>()
            && matches!(sqlx_error, sqlx::Error::RowNotFound)
        {
            return Some(AppError::not_found("not found"));
        }
    }
    None
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(error: E) -> Self {
        let error: anyhow::Error = error.into();
        if let Some(classified) = classify(&error) {
            tracing::debug!(error = %error, status = %classified.status, "request failed");
            return classified;
        }

        tracing::error!(error = %error, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct Body {
            code: u16,
            message: String,
            success: bool,
        }

        let body = Json(Body {
            code: self.status.as_u16(),
            message: self.message,
            success: false,
        });
        (self.status, body).into_response()
    }
}
