//! Response envelope: one [`ProcessingOutcome`] in, one HTTP response out.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use filegate_core::ProcessingOutcome;

use crate::error::HttpFailure;

/// Renders an outcome. Consumes it, so an outcome is rendered exactly once.
pub fn build(outcome: ProcessingOutcome, production: bool) -> Response {
    match outcome {
        ProcessingOutcome::Artifact(artifact) => {
            let content_type = HeaderValue::from_str(&artifact.mime_type)
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
            tracing::debug!(
                file_name = %artifact.file_name,
                mime_type = %artifact.mime_type,
                bytes = artifact.data.len(),
                "Returning artifact"
            );
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CONTENT_DISPOSITION, content_disposition(&artifact.file_name)),
                ],
                artifact.data,
            )
                .into_response()
        }
        ProcessingOutcome::StatusPayload(payload) => (StatusCode::OK, Json(payload)).into_response(),
        ProcessingOutcome::Failure(failure) => HttpFailure::new(failure, production).into_response(),
    }
}

/// `attachment; filename="..."` with quotes and backslashes escaped and
/// anything outside printable ASCII replaced.
pub fn content_disposition(file_name: &str) -> HeaderValue {
    let escaped: String = file_name
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect::<String>()
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", escaped))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
