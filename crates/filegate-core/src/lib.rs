//! Filegate Core Library
//!
//! This crate provides the domain models, error taxonomy, configuration and
//! filename sanitization shared by every Filegate component.

pub mod config;
pub mod error;
pub mod models;
pub mod sanitize;

// Re-export commonly used types
pub use config::{BaseConfig, Config, GatewayConfig, StagingConfig, ToolPaths};
pub use error::{ErrorMetadata, FailureKind, LogLevel, ProcessingFailure};
pub use models::{
    Artifact, CapabilityGroup, InputPolicy, OptionSchema, Options, ProcessingOutcome, RawOptions,
    StagedFile, UploadedArtifact,
};
pub use sanitize::{sanitize, SanitizedFilename};
