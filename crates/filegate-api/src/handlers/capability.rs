//! The single capability endpoint: `POST /{capability}`.

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, Path, State};
use axum::response::{IntoResponse, Response};
use filegate_core::ProcessingFailure;

use crate::envelope;
use crate::error::{ErrorResponse, HttpFailure};
use crate::state::AppState;
use crate::utils::multipart::{read_capability_request, CapabilityRequest};

#[utoipa::path(
    post,
    path = "/{capability}",
    tag = "capabilities",
    params(
        ("capability" = String, Path, description = "Capability key, e.g. img-compress or protect-pdf")
    ),
    request_body(content = inline(Object), content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Processed file as an attachment, or a JSON status payload"),
        (status = 400, description = "Options or content the capability cannot use", body = ErrorResponse),
        (status = 404, description = "Unknown capability", body = ErrorResponse),
        (status = 413, description = "Upload too large", body = ErrorResponse),
        (status = 422, description = "Unsupported file type or no file", body = ErrorResponse),
        (status = 500, description = "Processing or staging failure", body = ErrorResponse),
        (status = 504, description = "Processing timed out", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(capability = %capability))]
pub async fn run_capability(
    State(state): State<Arc<AppState>>,
    Path(capability): Path<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let production = state.is_production();

    if state.registry.resolve(&capability).is_err() {
        let failure = ProcessingFailure::not_found(format!("Unknown capability '{}'", capability));
        return HttpFailure::new(failure, production).into_response();
    }

    // A body that is not multipart carries no files and no options; the
    // dispatcher decides whether that is acceptable for this capability.
    let request = match multipart {
        Ok(multipart) => {
            match read_capability_request(multipart, state.dispatcher.limits().max_upload_bytes).await {
                Ok(request) => request,
                Err(failure) => return HttpFailure::new(failure, production).into_response(),
            }
        }
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Request body is not multipart");
            CapabilityRequest::default()
        }
    };

    let outcome = state
        .dispatcher
        .dispatch(&capability, request.uploads, request.options)
        .await;
    envelope::build(outcome, production)
}
