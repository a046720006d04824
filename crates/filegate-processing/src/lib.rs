//! Filegate Processing Library
//!
//! Capability handlers and everything they share:
//! - The handler trait, descriptors and the registry
//! - Batch expansion of ZIP uploads and output packaging
//! - External tool execution
//! - Image, video, audio and document processing, each behind a feature

pub mod batch;
pub mod capability;
pub mod catalog;
pub mod mime;
pub mod registry;
pub mod tools;
pub mod traits;
pub mod watermark;

#[cfg(feature = "image")]
pub mod image;

#[cfg(feature = "image")]
pub mod media_watermark;

#[cfg(feature = "image")]
pub mod compress;

#[cfg(any(feature = "video", feature = "audio"))]
pub mod download;

#[cfg(feature = "video")]
pub mod video;

#[cfg(feature = "audio")]
pub mod audio;

#[cfg(feature = "document")]
pub mod document;

// Re-export commonly used types
pub use capability::CapabilityDescriptor;
pub use catalog::default_registry;
pub use registry::{CapabilityRegistry, RegistryError};
pub use tools::ExternalTool;
pub use traits::{CapabilityHandler, HandlerJob};
