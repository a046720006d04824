pub mod dispatch;

pub use dispatch::{DispatchLimits, Dispatcher};
