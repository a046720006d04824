//! Data models shared by the dispatcher, the handlers and the API layer.

mod artifact;
mod capability;
mod outcome;

pub use artifact::*;
pub use capability::*;
pub use outcome::*;
