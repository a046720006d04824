//! `compress`: one size knob for images, PDFs and office documents.
//!
//! Images are downscaled and re-encoded, PDFs go through Ghostscript, and
//! OOXML packages get their embedded media recompressed. Legacy binary office
//! formats are returned as they are.

use std::io::{Cursor, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use filegate_core::ProcessingOutcome;
use image::imageops::FilterType;
use image::DynamicImage;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::batch::{
    collect_items, read_item, read_member_bounded, run_batch, run_blocking, BatchItem, ItemError,
    OutputFile, MAX_ARCHIVE_MEMBERS, MAX_IN_MEMORY_EXPANSION_BYTES,
};
use crate::image::codec::{self, OutputFormat};
use crate::tools::ExternalTool;
use crate::traits::{CapabilityHandler, HandlerJob};

pub const COMPRESS_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "pdf", "docx", "pptx", "xlsx", "doc", "ppt",
];
const IMAGE_INPUTS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const OOXML_INPUTS: &[&str] = &["docx", "pptx", "xlsx"];
const MEDIA_PREFIXES: &[&str] = &["word/media/", "ppt/media/", "xl/media/"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionPreset {
    pub jpeg_quality: u8,
    /// Linear scale applied to raster images before re-encoding.
    pub scale: f32,
    /// Ghostscript `-dPDFSETTINGS` value.
    pub pdf_settings: &'static str,
    /// Target resolution for images inside PDFs.
    pub dpi: u32,
}

impl CompressionPreset {
    pub const LOW: Self = Self {
        jpeg_quality: 90,
        scale: 1.0,
        pdf_settings: "/ebook",
        dpi: 150,
    };
    pub const MEDIUM: Self = Self {
        jpeg_quality: 75,
        scale: 0.95,
        pdf_settings: "/screen",
        dpi: 100,
    };
    pub const HIGH: Self = Self {
        jpeg_quality: 60,
        scale: 0.8,
        pdf_settings: "/screen",
        dpi: 72,
    };
    pub const MAXIMUM: Self = Self {
        jpeg_quality: 40,
        scale: 0.6,
        pdf_settings: "/screen",
        dpi: 50,
    };

    /// Unknown levels fall back to `medium`.
    pub fn parse(level: &str) -> Self {
        match level.trim().to_lowercase().as_str() {
            "low" => Self::LOW,
            "medium" => Self::MEDIUM,
            "high" => Self::HIGH,
            "maximum" | "max" => Self::MAXIMUM,
            other => {
                tracing::debug!(level = other, "Unknown compression level, using medium");
                Self::MEDIUM
            }
        }
    }

    fn resize(&self, img: DynamicImage) -> DynamicImage {
        if self.scale >= 1.0 {
            return img;
        }
        let width = ((img.width() as f32 * self.scale).round() as u32).max(1);
        let height = ((img.height() as f32 * self.scale).round() as u32).max(1);
        img.resize_exact(width, height, FilterType::Lanczos3)
    }

    fn gs_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-sDEVICE=pdfwrite",
            "-dCompatibilityLevel=1.4",
            "-dNOPAUSE",
            "-dQUIET",
            "-dBATCH",
            "-dSAFER",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(format!("-dPDFSETTINGS={}", self.pdf_settings));
        args.extend(
            [
                "-dCompressPages=true",
                "-dDownsampleColorImages=true",
                "-dDownsampleGrayImages=true",
                "-dDownsampleMonoImages=true",
                "-dColorImageDownsampleType=/Bicubic",
                "-dGrayImageDownsampleType=/Bicubic",
                "-dAutoFilterColorImages=false",
                "-dAutoFilterGrayImages=false",
                "-dColorImageFilter=/DCTEncode",
                "-dGrayImageFilter=/DCTEncode",
                "-dEmbedAllFonts=true",
                "-dSubsetFonts=true",
                "-dCompressFonts=true",
                "-dDetectDuplicateImages=true",
                "-dPreserveAnnots=false",
                "-dOptimize=true",
                "-dUseFlateCompression=true",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        for kind in ["Color", "Gray", "Mono"] {
            args.push(format!("-d{}ImageResolution={}", kind, self.dpi));
        }
        args
    }
}

pub struct CompressHandler {
    gs: ExternalTool,
}

impl CompressHandler {
    pub fn new(gs: ExternalTool) -> Self {
        Self { gs }
    }
}

#[async_trait]
impl CapabilityHandler for CompressHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let preset = CompressionPreset::parse(&job.options.get_str("option").unwrap_or_default());
        let items = collect_items(&job, None, COMPRESS_EXTENSIONS).await?;
        run_batch(&job, items, "compressed", |item, out_dir| {
            compress_one(&self.gs, item, out_dir, preset)
        })
        .await
    }
}

async fn compress_one(
    gs: &ExternalTool,
    item: BatchItem,
    out_dir: PathBuf,
    preset: CompressionPreset,
) -> Result<Vec<OutputFile>, ItemError> {
    let ext = item.extension.clone();
    if ext == "pdf" {
        return compress_pdf(gs, item, out_dir, preset).await;
    }

    let data = read_item(&item).await?;
    let original_len = data.len();

    if IMAGE_INPUTS.contains(&ext.as_str()) {
        let format = OutputFormat::for_extension(&ext);
        let output = OutputFile::named(&out_dir, &item.stem, "compressed", format.extension());
        let path = output.path.clone();
        let name = item.file_name.clone();
        run_blocking(move || {
            let img = codec::decode(&data)
                .map_err(|_| ItemError::Rejected(format!("{} is not a recognized image", name)))?;
            let encoded = codec::encode(&preset.resize(img), format, preset.jpeg_quality)?;
            std::fs::write(&path, encoded).map_err(anyhow::Error::from)?;
            Ok(())
        })
        .await?;
        return Ok(vec![output]);
    }

    let output = OutputFile::named(&out_dir, &item.stem, "compressed", &ext);
    let packed = if OOXML_INPUTS.contains(&ext.as_str()) {
        let name = item.file_name.clone();
        run_blocking(move || {
            match recompress_package(&data, &preset, MAX_IN_MEMORY_EXPANSION_BYTES) {
                Err(ItemError::Failed(_)) => Err(ItemError::Rejected(format!(
                    "{} is not a valid {} document",
                    name, ext
                ))),
                other => other,
            }
        })
        .await?
    } else {
        data
    };

    tracing::debug!(original_len, compressed_len = packed.len(), file = %item.file_name, "Document compressed");
    tokio::fs::write(&output.path, packed)
        .await
        .context("Failed to write compressed document")?;
    Ok(vec![output])
}

/// Ghostscript rewrite. When that does not shrink the file, the original
/// bytes are returned under the output name.
async fn compress_pdf(
    gs: &ExternalTool,
    item: BatchItem,
    out_dir: PathBuf,
    preset: CompressionPreset,
) -> Result<Vec<OutputFile>, ItemError> {
    let output = OutputFile::named(&out_dir, &item.stem, "compressed", "pdf");
    let mut args = preset.gs_args();
    args.push(format!("-sOutputFile={}", output.path.display()));
    args.push(item.path.to_string_lossy().into_owned());

    let output_status = gs.run_unchecked(&args).await?;
    if !output_status.status.success() {
        tracing::warn!(
            file = %item.file_name,
            status = %output_status.status,
            stderr = %crate::tools::stderr_tail(&output_status.stderr),
            "Ghostscript rejected input"
        );
        return Err(ItemError::Rejected(format!("{} is not a valid PDF", item.file_name)));
    }

    let original_len = tokio::fs::metadata(&item.path)
        .await
        .context("Failed to stat input")?
        .len();
    let compressed_len = tokio::fs::metadata(&output.path)
        .await
        .map(|m| m.len())
        .unwrap_or(u64::MAX);
    if compressed_len >= original_len {
        tracing::debug!(file = %item.file_name, "Compression did not help, keeping original");
        tokio::fs::copy(&item.path, &output.path)
            .await
            .context("Failed to copy original PDF")?;
    }
    Ok(vec![output])
}

/// Rewrites an OOXML package with its embedded JPEG and PNG media
/// recompressed. A recompressed image is kept only when it is smaller.
///
/// All parts together may expand to at most `budget` bytes. A malformed
/// package is `ItemError::Failed`; an oversized one is `Rejected`.
fn recompress_package(
    data: &[u8],
    preset: &CompressionPreset,
    mut budget: u64,
) -> Result<Vec<u8>, ItemError> {
    let mut archive = ZipArchive::new(Cursor::new(data)).context("Not a ZIP package")?;
    if archive.len() > MAX_ARCHIVE_MEMBERS {
        return Err(ItemError::Rejected(format!(
            "Document has more than {} parts",
            MAX_ARCHIVE_MEMBERS
        )));
    }
    let mut buffer = Vec::new();
    {
        let mut writer = ZipWriter::new(Cursor::new(&mut buffer));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).context("Failed to read package part")?;
            let name = entry.name().to_string();
            if entry.is_dir() {
                writer
                    .add_directory(name, options)
                    .context("Failed to write package")?;
                continue;
            }
            let mut contents = read_member_bounded(&mut entry, &name, &mut budget)?;

            if let Some(smaller) = recompress_media(&name, &contents, preset) {
                contents = smaller;
            }
            writer
                .start_file(name, options)
                .context("Failed to write package")?;
            writer
                .write_all(&contents)
                .context("Failed to write package")?;
        }
        writer.finish().context("Failed to write package")?;
    }
    Ok(buffer)
}

fn recompress_media(name: &str, contents: &[u8], preset: &CompressionPreset) -> Option<Vec<u8>> {
    if !MEDIA_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return None;
    }
    let ext = name.rsplit('.').next()?.to_ascii_lowercase();
    let format = match ext.as_str() {
        "jpg" | "jpeg" => OutputFormat::Jpeg,
        "png" => OutputFormat::Png,
        _ => return None,
    };
    let img = codec::decode(contents).ok()?;
    let encoded = codec::encode(&preset.resize(img), format, preset.jpeg_quality).ok()?;
    (encoded.len() < contents.len()).then_some(encoded)
}
