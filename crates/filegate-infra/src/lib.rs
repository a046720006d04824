//! Filegate Infrastructure Library
//!
//! Filesystem plumbing shared by the API server:
//! - Request-scoped staging directories with guaranteed release
//! - The stale staging sweep

pub mod staging;
pub mod sweep;

// Re-export commonly used types
pub use staging::{ScopedStagingDir, StagingArea, StagingError, SweepReport};
pub use sweep::StagingSweeper;
