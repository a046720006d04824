//! Image capabilities: compression, format conversion, upscaling, background
//! removal, plus the codec and overlay helpers they share.

pub mod codec;
mod handlers;
pub mod overlay;

pub use handlers::{
    CompressImageHandler, ConvertImageHandler, RemoveBackgroundHandler, UpscaleImageHandler,
};

/// Raster formats the native image handlers can decode.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "gif", "tiff", "tif"];
