pub mod capability;
pub mod health;
pub mod index;
pub mod status;
