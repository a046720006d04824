use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};

use crate::watermark::WatermarkSettings;

/// Largest watermark width relative to the image it is placed on.
const MAX_WATERMARK_WIDTH_RATIO: f32 = 0.4;

pub struct Watermark;

impl Watermark {
    /// Overlay `mark` onto `img` using the position, opacity and rotation in
    /// `settings`. The mark is shrunk to at most 40% of the image width.
    pub fn apply(img: &DynamicImage, mark: &DynamicImage, settings: &WatermarkSettings) -> DynamicImage {
        let (img_width, img_height) = img.dimensions();
        let mut mark_img = Self::prepare(mark, settings);

        let max_width = ((img_width as f32 * MAX_WATERMARK_WIDTH_RATIO) as u32).max(1);
        if mark_img.width() > max_width {
            let ratio = max_width as f32 / mark_img.width() as f32;
            let new_height = ((mark_img.height() as f32 * ratio) as u32).max(1);
            mark_img = imageops::resize(&mark_img, max_width, new_height, FilterType::Lanczos3);
        }

        let (x, y) = settings
            .position
            .coords((img_width, img_height), mark_img.dimensions());

        let mut img_rgba = img.to_rgba8();
        imageops::overlay(&mut img_rgba, &mark_img, x, y);

        DynamicImage::ImageRgba8(img_rgba)
    }

    /// The mark with opacity and rotation applied, before any resizing.
    pub fn prepare(mark: &DynamicImage, settings: &WatermarkSettings) -> RgbaImage {
        let mut mark_img = mark.to_rgba8();

        // Apply opacity
        if settings.opacity < 1.0 {
            for pixel in mark_img.pixels_mut() {
                pixel[3] = (pixel[3] as f32 * settings.opacity) as u8;
            }
        }

        if settings.rotation.rem_euclid(360.0) != 0.0 {
            mark_img = rotate_expanded(&mark_img, settings.rotation);
        }

        mark_img
    }
}

/// Counter-clockwise rotation that grows the canvas to fit the rotated image.
fn rotate_expanded(src: &RgbaImage, degrees: f32) -> RgbaImage {
    let (w, h) = (src.width() as f32, src.height() as f32);
    let theta = degrees.to_radians();
    let (sin, cos) = (theta.sin().abs(), theta.cos().abs());
    // The small bias keeps float noise at right angles from adding a pixel.
    let out_w = (w * cos + h * sin - 1e-3).ceil().max(1.0) as u32;
    let out_h = (w * sin + h * cos - 1e-3).ceil().max(1.0) as u32;

    let side = out_w.max(out_h).max(src.width()).max(src.height());
    let mut canvas = RgbaImage::from_pixel(side, side, Rgba([0, 0, 0, 0]));
    imageops::overlay(
        &mut canvas,
        src,
        ((side - src.width()) / 2) as i64,
        ((side - src.height()) / 2) as i64,
    );

    // rotate_about_center turns clockwise.
    let rotated = rotate_about_center(&canvas, -theta, Interpolation::Bilinear, Rgba([0, 0, 0, 0]));
    imageops::crop_imm(&rotated, (side - out_w) / 2, (side - out_h) / 2, out_w, out_h).to_image()
}
