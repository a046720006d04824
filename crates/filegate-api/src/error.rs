//! HTTP error response conversion
//!
//! Every failure leaves the API as a [`ProcessingFailure`] rendered through
//! [`ErrorMetadata`]: a stable `error` kind, a client-safe `message`, and
//! detail only outside production.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use filegate_core::{ErrorMetadata, LogLevel, ProcessingFailure};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Failure kind, e.g. `unsupported_type`
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Machine-readable error code for programmatic handling
    pub code: String,
    /// Whether this error is recoverable (can be retried)
    pub recoverable: bool,
    /// Suggested action for the client (e.g., "Retry with a smaller file")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

/// A failure plus the one bit of context rendering needs.
#[derive(Debug)]
pub struct HttpFailure {
    pub failure: ProcessingFailure,
    pub production: bool,
}

impl HttpFailure {
    pub fn new(failure: ProcessingFailure, production: bool) -> Self {
        Self {
            failure,
            production,
        }
    }
}

fn log_failure(failure: &ProcessingFailure) {
    let detail = failure.detail.as_deref().unwrap_or("");
    match failure.log_level() {
        LogLevel::Debug => {
            tracing::debug!(error = %failure, detail, "Request failed");
        }
        LogLevel::Warn => {
            tracing::warn!(error = %failure, detail, "Request failed");
        }
        LogLevel::Error => {
            tracing::error!(error = %failure, detail, "Request failed");
        }
    }
}

impl IntoResponse for HttpFailure {
    fn into_response(self) -> Response {
        let failure = &self.failure;
        let status =
            StatusCode::from_u16(failure.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        log_failure(failure);

        // Detail never leaves a production deployment.
        let details = if self.production {
            None
        } else {
            failure.detail.clone()
        };
        let body = Json(ErrorResponse {
            error: failure.kind.as_str().to_string(),
            message: failure.client_message(),
            details,
            code: failure.error_code().to_string(),
            recoverable: failure.is_recoverable(),
            suggested_action: failure.suggested_action().map(String::from),
        });

        (status, body).into_response()
    }
}
