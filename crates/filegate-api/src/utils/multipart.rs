//! Multipart extraction for capability requests
//!
//! Every part with a filename is an upload; every other part is an option.
//! The size limit is enforced while reading, so an oversized request is cut
//! off before it is buffered in full.

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::Multipart;
use axum::http::StatusCode;
use bytes::BytesMut;
use filegate_core::{ProcessingFailure, RawOptions, UploadedArtifact};

/// Largest text option accepted. Options are short knobs, not payloads.
const MAX_OPTION_BYTES: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct CapabilityRequest {
    pub uploads: Vec<UploadedArtifact>,
    pub options: RawOptions,
}

fn too_large(max_bytes: usize) -> ProcessingFailure {
    ProcessingFailure::payload_too_large(format!(
        "Upload exceeds the maximum size of {} MB",
        max_bytes / 1024 / 1024
    ))
}

fn read_failure(err: MultipartError, max_bytes: usize) -> ProcessingFailure {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        too_large(max_bytes)
    } else {
        ProcessingFailure::invalid_input("Failed to read multipart body").with_detail(err.body_text())
    }
}

/// Reads all parts. Uploads larger than `max_bytes` in total end the read
/// with `PayloadTooLarge`.
pub async fn read_capability_request(
    mut multipart: Multipart,
    max_bytes: usize,
) -> Result<CapabilityRequest, ProcessingFailure> {
    let mut request = CapabilityRequest::default();
    let mut total = 0usize;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| read_failure(e, max_bytes))?
    {
        let name = field.name().unwrap_or_default().to_string();

        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field.content_type().map(str::to_string);
                let data = read_limited(field, max_bytes.saturating_sub(total))
                    .await
                    .map_err(|e| match e {
                        ReadError::Limit => too_large(max_bytes),
                        ReadError::Multipart(e) => read_failure(e, max_bytes),
                    })?;
                total += data.len();

                let mut upload = UploadedArtifact::new(name, file_name, data.freeze());
                if let Some(content_type) = content_type {
                    upload = upload.with_content_type(content_type);
                }
                request.uploads.push(upload);
            }
            None => {
                let value = read_limited(field, MAX_OPTION_BYTES)
                    .await
                    .map_err(|e| match e {
                        ReadError::Limit => ProcessingFailure::invalid_input(format!(
                            "Option '{}' is too long",
                            name
                        )),
                        ReadError::Multipart(e) => read_failure(e, max_bytes),
                    })?;
                // Later duplicates win, as with an ordinary form.
                request
                    .options
                    .insert(name, String::from_utf8_lossy(&value).into_owned());
            }
        }
    }

    tracing::debug!(
        uploads = request.uploads.len(),
        options = request.options.len(),
        bytes = total,
        "Read multipart request"
    );
    Ok(request)
}

enum ReadError {
    Limit,
    Multipart(MultipartError),
}

async fn read_limited(mut field: Field<'_>, limit: usize) -> Result<BytesMut, ReadError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(ReadError::Multipart)? {
        if buffer.len() + chunk.len() > limit {
            return Err(ReadError::Limit);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}
