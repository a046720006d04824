use std::ffi::OsStr;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use filegate_core::{ProcessingFailure, ProcessingOutcome};
use image::imageops::FilterType;
use image::GenericImageView;

use super::codec::{self, OutputFormat};
use super::IMAGE_EXTENSIONS;
use crate::batch::{collect_items, read_item, run_batch, run_blocking, BatchItem, ItemError, OutputFile};
use crate::tools::ExternalTool;
use crate::traits::{CapabilityHandler, HandlerJob};

const UPSCALE_FACTORS: [u32; 4] = [2, 4, 8, 16];
const UPSCALE_JPEG_QUALITY: u8 = 90;
/// Upscaled images larger than this are refused.
const MAX_UPSCALED_PIXELS: u64 = 200_000_000;

fn not_an_image(item: &BatchItem) -> ItemError {
    ItemError::Rejected(format!("{} is not a recognized image", item.file_name))
}

/// `img-compress`: re-encode each image in its own format family.
pub struct CompressImageHandler;

#[async_trait]
impl CapabilityHandler for CompressImageHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let quality = job.options.get_u32("quality").unwrap_or(85).clamp(1, 100) as u8;
        let items = collect_items(&job, None, IMAGE_EXTENSIONS).await?;
        run_batch(&job, items, "compressed", |item, out_dir| {
            compress_one(item, out_dir, quality)
        })
        .await
    }
}

async fn compress_one(item: BatchItem, out_dir: PathBuf, quality: u8) -> Result<Vec<OutputFile>, ItemError> {
    let data = read_item(&item).await?;
    let format = OutputFormat::for_extension(&item.extension);
    let output = OutputFile::named(&out_dir, &item.stem, "compressed", format.extension());
    let path = output.path.clone();

    let original_len = data.len();
    let written = run_blocking(move || {
        let img = codec::decode(&data).map_err(|_| not_an_image(&item))?;
        let encoded = codec::encode_compressed(&img, format, quality)?;
        std::fs::write(&path, &encoded).map_err(anyhow::Error::from)?;
        Ok(encoded.len())
    })
    .await?;

    tracing::debug!(original_len, compressed_len = written, "Image compressed");
    Ok(vec![output])
}

/// `img-jpg`, `img-png`, `img-webp`: convert every image to one format.
pub struct ConvertImageHandler {
    target: OutputFormat,
    archive_suffix: &'static str,
}

impl ConvertImageHandler {
    pub fn new(target: OutputFormat) -> Self {
        let archive_suffix = match target {
            OutputFormat::Jpeg => "jpgs",
            OutputFormat::Png => "pngs",
            OutputFormat::WebP => "webp",
        };
        Self {
            target,
            archive_suffix,
        }
    }

    fn default_quality(&self) -> u32 {
        match self.target {
            OutputFormat::WebP => 80,
            _ => 85,
        }
    }
}

#[async_trait]
impl CapabilityHandler for ConvertImageHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, target = ?self.target))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let quality = job
            .options
            .get_u32("quality")
            .unwrap_or_else(|| self.default_quality())
            .clamp(1, 100) as u8;

        // JPEG output may be named .jpg or .jpeg.
        let extension = match (self.target, job.options.get_keyword("format")) {
            (OutputFormat::Jpeg, Some(format)) => match format.to_lowercase().as_str() {
                "jpg" => "jpg",
                "jpeg" => "jpeg",
                other => {
                    return Ok(ProcessingFailure::invalid_input(format!(
                        "Invalid format '{}'. Allowed values: jpg, jpeg",
                        other
                    ))
                    .into())
                }
            },
            (target, _) => target.extension(),
        };

        let target = self.target;
        let items = collect_items(&job, None, IMAGE_EXTENSIONS).await?;
        run_batch(&job, items, self.archive_suffix, |item, out_dir| {
            convert_one(item, out_dir, target, extension, quality)
        })
        .await
    }
}

async fn convert_one(
    item: BatchItem,
    out_dir: PathBuf,
    target: OutputFormat,
    extension: &'static str,
    quality: u8,
) -> Result<Vec<OutputFile>, ItemError> {
    let data = read_item(&item).await?;
    let output = OutputFile::plain(&out_dir, &item.stem, extension);
    let path = output.path.clone();

    run_blocking(move || {
        let img = codec::decode(&data).map_err(|_| not_an_image(&item))?;
        let encoded = codec::encode(&img, target, quality)?;
        std::fs::write(&path, encoded).map_err(anyhow::Error::from)?;
        Ok(())
    })
    .await?;

    Ok(vec![output])
}

/// `upscale`: Lanczos3 enlargement by 2, 4, 8 or 16, saved as JPEG.
pub struct UpscaleImageHandler;

#[async_trait]
impl CapabilityHandler for UpscaleImageHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let scale = match job.options.get_u32("scale") {
            Some(scale) if UPSCALE_FACTORS.contains(&scale) => scale,
            _ => {
                return Ok(ProcessingFailure::invalid_input(
                    "Invalid scale. Allowed values: 2,4,8,16",
                )
                .into())
            }
        };

        let items = collect_items(&job, None, IMAGE_EXTENSIONS).await?;
        let archive_suffix = format!("upscaled_x{}", scale);
        run_batch(&job, items, &archive_suffix, |item, out_dir| {
            upscale_one(item, out_dir, scale)
        })
        .await
    }
}

async fn upscale_one(item: BatchItem, out_dir: PathBuf, scale: u32) -> Result<Vec<OutputFile>, ItemError> {
    let data = read_item(&item).await?;
    let output = OutputFile::named(&out_dir, &item.stem, &format!("upscaled_x{}", scale), "jpg");
    let path = output.path.clone();

    run_blocking(move || {
        let img = codec::decode(&data).map_err(|_| not_an_image(&item))?;
        let (width, height) = img.dimensions();
        let (new_width, new_height) = (width as u64 * scale as u64, height as u64 * scale as u64);
        if new_width * new_height > MAX_UPSCALED_PIXELS {
            return Err(ItemError::Rejected(format!(
                "{} is too large to upscale x{} ({}x{})",
                item.file_name, scale, new_width, new_height
            )));
        }
        let upscaled = img.resize_exact(new_width as u32, new_height as u32, FilterType::Lanczos3);
        let encoded = codec::encode_jpeg(&upscaled, UPSCALE_JPEG_QUALITY)?;
        std::fs::write(&path, encoded).map_err(anyhow::Error::from)?;
        Ok(())
    })
    .await?;

    Ok(vec![output])
}

/// `remove-imgbg`: delegates to the `rembg` CLI, which always writes PNG.
pub struct RemoveBackgroundHandler {
    rembg: ExternalTool,
}

impl RemoveBackgroundHandler {
    pub const EXTENSIONS: &'static [&'static str] = &["jpg", "jpeg", "png", "webp"];

    pub fn new(rembg: ExternalTool) -> Self {
        Self { rembg }
    }
}

#[async_trait]
impl CapabilityHandler for RemoveBackgroundHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let items = collect_items(&job, None, Self::EXTENSIONS).await?;
        run_batch(&job, items, "nobg", |item, out_dir| {
            remove_background_one(self.rembg.clone(), item, out_dir)
        })
        .await
    }
}

async fn remove_background_one(
    rembg: ExternalTool,
    item: BatchItem,
    out_dir: PathBuf,
) -> Result<Vec<OutputFile>, ItemError> {
    let output = OutputFile::named(&out_dir, &item.stem, "nobg", "png");
    rembg
        .run([OsStr::new("i"), item.path.as_os_str(), output.path.as_os_str()])
        .await?;
    Ok(vec![output])
}
