//! Image decoding and encoding.

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use color_quant::NeuQuant;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageReader, Rgb, RgbImage, Rgba};

/// Output format for re-encoded images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::WebP),
            _ => Err(anyhow!("Invalid format: {}", s)),
        }
    }

    /// Format an input extension is re-encoded into when it is kept in its
    /// own family. Formats without a lossy encoder here fall back to JPEG.
    pub fn for_extension(ext: &str) -> Self {
        match ext {
            "png" => OutputFormat::Png,
            "webp" => OutputFormat::WebP,
            _ => OutputFormat::Jpeg,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
        }
    }
}

/// Decodes an image, trusting its content over its extension.
pub fn decode(data: &[u8]) -> Result<DynamicImage> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .context("Failed to read image header")?;
    reader.decode().context("Uploaded file is not a recognized image")
}

/// Composites any alpha channel onto a white background.
pub fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, px) in rgba.enumerate_pixels() {
        let alpha = px[3] as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(px[0]), blend(px[1]), blend(px[2])]));
    }
    out
}

/// JPEG via mozjpeg, alpha flattened on white.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb_img = flatten_on_white(img);
    let (width, height) = rgb_img.dimensions();

    let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
    comp.set_size(width as usize, height as usize);
    comp.set_quality(quality.clamp(1, 100) as f32);
    comp.set_progressive_mode();
    comp.set_optimize_coding(true);

    let mut comp = comp.start_compress(Vec::new())?;
    comp.write_scanlines(&rgb_img)?;
    let jpeg_data = comp.finish()?;

    Ok(jpeg_data)
}

/// Lossless PNG at the strongest compression level.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let normalized = if img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    };

    let mut buffer = Vec::new();
    let encoder =
        PngEncoder::new_with_quality(&mut buffer, CompressionType::Best, FilterType::Adaptive);
    normalized
        .write_with_encoder(encoder)
        .context("Failed to encode PNG")?;
    Ok(buffer)
}

/// PNG quality from which compression stays lossless.
pub const LOSSLESS_PNG_QUALITY: u8 = 95;
/// NeuQuant sampling factor: 1 is slowest and best, 30 fastest.
const QUANT_SAMPLE_FACTOR: i32 = 10;

/// Palette size for a lossy PNG: 16 colors at quality 0 up to 256 just below
/// [`LOSSLESS_PNG_QUALITY`].
pub fn png_palette_size(quality: u8) -> Option<usize> {
    (quality < LOSSLESS_PNG_QUALITY)
        .then(|| 16 + quality as usize * 240 / LOSSLESS_PNG_QUALITY as usize)
}

/// Maps every pixel onto a palette of at most `colors` entries learned from
/// the image itself. Alpha is kept when the source has it.
pub fn quantize(img: &DynamicImage, colors: usize) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    let quant = NeuQuant::new(QUANT_SAMPLE_FACTOR, colors.clamp(2, 256), rgba.as_raw());
    for px in rgba.pixels_mut() {
        if let Some(mapped) = quant.lookup(quant.index_of(&px.0)) {
            *px = Rgba(mapped);
        }
    }
    if img.color().has_alpha() {
        DynamicImage::ImageRgba8(rgba)
    } else {
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(rgba).to_rgb8())
    }
}

/// Lossy WebP.
pub fn encode_webp(img: &DynamicImage, quality: f32) -> Result<Vec<u8>> {
    let rgba_img = img.to_rgba8();
    let (width, height) = rgba_img.dimensions();

    let encoder = webp::Encoder::from_rgba(&rgba_img, width, height);
    let webp_data = encoder.encode(quality.clamp(0.0, 100.0));

    Ok(webp_data.to_vec())
}

pub fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
    match format {
        OutputFormat::Jpeg => encode_jpeg(img, quality),
        OutputFormat::Png => encode_png(img),
        OutputFormat::WebP => encode_webp(img, quality as f32),
    }
}

/// Re-encoding for `img-compress`. PNG below [`LOSSLESS_PNG_QUALITY`] is
/// quantized first; everything else goes through [`encode`].
pub fn encode_compressed(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
    match (format, png_palette_size(quality)) {
        (OutputFormat::Png, Some(colors)) => encode_png(&quantize(img, colors)),
        _ => encode(img, format, quality),
    }
}
