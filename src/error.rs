use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Application error taxonomy.
///
/// Every subsystem surfaces one of these kinds at the HTTP boundary; the
/// mapping to status codes lives in the `IntoResponse` impl below.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication required: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Trade rejected by risk engine: {reason}")]
    RiskDenied {
        reason: String,
        detail: Option<String>,
    },

    #[error("Circuit breaker open for {resource}")]
    BreakerOpen {
        resource: String,
        retry_after_secs: u64,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Vault failure")]
    Vault,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code for each kind.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Auth(_) => "AUTH_ERROR",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::RiskDenied { .. } => "RISK_DENIED",
            AppError::BreakerOpen { .. } => "BREAKER_OPEN",
            AppError::Upstream(_) => "UPSTREAM_ERROR",
            AppError::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            AppError::Vault => "VAULT_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RiskDenied { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Vault => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        match self {
            AppError::BreakerOpen {
                resource,
                retry_after_secs,
            } => {
                let body = Json(json!({
                    "error": format!("circuit breaker open for {resource}"),
                    "code": code,
                    "retryable": true,
                    "retry_after_secs": retry_after_secs,
                }));
                (
                    status,
                    [(header::RETRY_AFTER, retry_after_secs.to_string())],
                    body,
                )
                    .into_response()
            }
            AppError::RiskDenied { reason, detail } => {
                let body = Json(json!({
                    "error": "trade rejected by risk engine",
                    "code": code,
                    "reason": reason,
                    "detail": detail,
                }));
                (status, body).into_response()
            }
            // Vault and internal failures stay opaque; details go to the log
            // with a correlation id the caller can quote back.
            AppError::Vault => {
                let correlation_id = uuid::Uuid::new_v4().to_string();
                error!(%correlation_id, "vault failure");
                let body = Json(json!({
                    "error": "internal error",
                    "code": code,
                    "correlation_id": correlation_id,
                }));
                (status, body).into_response()
            }
            AppError::Internal(detail) => {
                let correlation_id = uuid::Uuid::new_v4().to_string();
                error!(%correlation_id, %detail, "internal error");
                let body = Json(json!({
                    "error": "internal error",
                    "code": code,
                    "correlation_id": correlation_id,
                }));
                (status, body).into_response()
            }
            other => {
                let body = Json(json!({
                    "error": other.to_string(),
                    "code": code,
                }));
                (status, body).into_response()
            }
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Internal(format!("database: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
