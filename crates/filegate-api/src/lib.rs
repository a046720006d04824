//! Filegate API Library
//!
//! The HTTP surface: routes, multipart extraction, the dispatcher and the
//! response envelope.

// Module declarations
mod api_doc;
mod handlers;
mod telemetry;
mod utils;

// Public modules
pub mod envelope;
pub mod error;
pub mod services;
pub mod setup;
pub mod state;

// Re-exports
pub use error::ErrorResponse;
pub use services::{DispatchLimits, Dispatcher};
