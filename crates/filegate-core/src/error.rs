//! Error types module
//!
//! Every way a request can fail is one of the [`FailureKind`]s below. Handlers,
//! staging and validation all end up as a [`ProcessingFailure`] value at the
//! dispatch boundary, and the API layer renders it through [`ErrorMetadata`].

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues like resource limits
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "UNSUPPORTED_TYPE")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the client
    fn suggested_action(&self) -> Option<&'static str>;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Whether details should be hidden in production
    fn is_sensitive(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

/// The closed set of failure kinds a dispatch can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    UnsupportedType,
    PayloadTooLarge,
    Timeout,
    HandlerCrashed,
    StagingError,
    InvalidInput,
}

/// Static metadata for each kind: (http_status, error_code, recoverable, suggested_action, sensitive, log_level).
fn failure_kind_static_metadata(
    kind: FailureKind,
) -> (
    u16,
    &'static str,
    bool,
    Option<&'static str>,
    bool,
    LogLevel,
) {
    match kind {
        FailureKind::NotFound => (
            404,
            "NOT_FOUND",
            false,
            Some("Check the capability name against GET /"),
            false,
            LogLevel::Debug,
        ),
        FailureKind::UnsupportedType => (
            422,
            "UNSUPPORTED_TYPE",
            false,
            Some("Upload a file with one of the accepted extensions"),
            false,
            LogLevel::Debug,
        ),
        FailureKind::PayloadTooLarge => (
            413,
            "PAYLOAD_TOO_LARGE",
            false,
            Some("Reduce file size or split the upload"),
            false,
            LogLevel::Debug,
        ),
        FailureKind::Timeout => (
            504,
            "TIMEOUT",
            true,
            Some("Retry with a smaller file"),
            false,
            LogLevel::Warn,
        ),
        FailureKind::HandlerCrashed => (
            500,
            "HANDLER_CRASHED",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        FailureKind::StagingError => (
            500,
            "STAGING_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        FailureKind::InvalidInput => (
            400,
            "INVALID_INPUT",
            false,
            Some("Check request parameters and try again"),
            false,
            LogLevel::Debug,
        ),
    }
}

impl FailureKind {
    /// Stable `error` string used in response bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::UnsupportedType => "unsupported_type",
            FailureKind::PayloadTooLarge => "payload_too_large",
            FailureKind::Timeout => "timeout",
            FailureKind::HandlerCrashed => "handler_crashed",
            FailureKind::StagingError => "staging_error",
            FailureKind::InvalidInput => "invalid_input",
        }
    }

    pub fn http_status_code(&self) -> u16 {
        failure_kind_static_metadata(*self).0
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed dispatch: the kind, a client-safe message, and optional internal
/// detail (error chain, tool stderr) that is only shown outside production.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProcessingFailure {
    pub kind: FailureKind,
    pub message: String,
    pub detail: Option<String>,
}

impl ProcessingFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn unsupported_type(message: impl Into<String>) -> Self {
        Self::new(FailureKind::UnsupportedType, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(FailureKind::PayloadTooLarge, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn staging(message: impl Into<String>) -> Self {
        Self::new(FailureKind::StagingError, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    /// A handler returned an error. The chain goes into `detail`.
    pub fn handler_crashed(err: &anyhow::Error) -> Self {
        Self::new(FailureKind::HandlerCrashed, "Processing failed").with_detail(detailed_message(err))
    }
}

impl ErrorMetadata for ProcessingFailure {
    fn http_status_code(&self) -> u16 {
        failure_kind_static_metadata(self.kind).0
    }

    fn error_code(&self) -> &'static str {
        failure_kind_static_metadata(self.kind).1
    }

    fn is_recoverable(&self) -> bool {
        failure_kind_static_metadata(self.kind).2
    }

    fn suggested_action(&self) -> Option<&'static str> {
        failure_kind_static_metadata(self.kind).3
    }

    fn client_message(&self) -> String {
        self.message.clone()
    }

    fn is_sensitive(&self) -> bool {
        failure_kind_static_metadata(self.kind).4
    }

    fn log_level(&self) -> LogLevel {
        failure_kind_static_metadata(self.kind).5
    }
}

/// Walks the error chain (up to five levels) into one string.
pub fn detailed_message(err: &anyhow::Error) -> String {
    let mut msg = err.to_string();
    for (depth, cause) in err.chain().skip(1).enumerate() {
        if depth >= 5 {
            break;
        }
        msg.push_str(&format!(": {}", cause));
    }
    msg
}
