//! `watermark-imgvideo`: text or image watermarks on images and videos.
//!
//! Image marks on images are composited in-process. Text marks, and anything
//! applied to a video, go through ffmpeg.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use filegate_core::{ProcessingFailure, ProcessingOutcome};
use image::DynamicImage;

use crate::batch::{
    archive_name, collect_items, read_item, run_blocking, run_tool_on_item, run_units, BatchItem,
    ItemError, OutputFile,
};
use crate::image::codec;
use crate::image::overlay::Watermark;
use crate::image::IMAGE_EXTENSIONS;
use crate::mime::VIDEO_EXTENSIONS;
use crate::tools::ExternalTool;
use crate::traits::{CapabilityHandler, HandlerJob};
use crate::watermark::{WatermarkKind, WatermarkSettings};

/// Multipart field carrying the mark for `type=image`.
pub const WATERMARK_IMAGE_FIELD: &str = "image_file";
const WATERMARKED_JPEG_QUALITY: u8 = 95;
const VIDEO_CRF: &str = "23";

pub struct WatermarkMediaHandler {
    ffmpeg: ExternalTool,
}

impl WatermarkMediaHandler {
    pub fn new(ffmpeg: ExternalTool) -> Self {
        Self { ffmpeg }
    }
}

/// Everything one item needs, prepared once per request.
struct MarkContext {
    ffmpeg: ExternalTool,
    settings: WatermarkSettings,
    /// Decoded mark for `type=image`.
    mark: Option<DynamicImage>,
    /// The mark with opacity and rotation baked in, for ffmpeg.
    mark_png: PathBuf,
    text_file: PathBuf,
}

#[async_trait]
impl CapabilityHandler for WatermarkMediaHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let settings = match WatermarkSettings::from_options(&job.options) {
            Ok(settings) => settings,
            Err(msg) => return Ok(ProcessingFailure::invalid_input(msg).into()),
        };

        let mark_png = job.work_dir.join("watermark.png");
        let text_file = job.work_dir.join("watermark.txt");
        let mark = match settings.kind {
            WatermarkKind::Text => {
                tokio::fs::write(&text_file, settings.text.as_bytes())
                    .await
                    .context("Failed to write watermark text")?;
                None
            }
            WatermarkKind::Image => {
                let Some(source) = job.inputs_in_field(WATERMARK_IMAGE_FIELD).next() else {
                    return Ok(ProcessingFailure::invalid_input(
                        "An image_file upload is required for image watermarks",
                    )
                    .into());
                };
                let data = tokio::fs::read(&source.path)
                    .await
                    .context("Failed to read watermark image")?;
                let prepared_settings = settings.clone();
                let png_path = mark_png.clone();
                let decoded = run_blocking(move || {
                    let mark = codec::decode(&data).map_err(|_| {
                        ItemError::Rejected("The watermark image is not a recognized image".to_string())
                    })?;
                    let prepared = DynamicImage::ImageRgba8(Watermark::prepare(&mark, &prepared_settings));
                    std::fs::write(&png_path, codec::encode_png(&prepared)?)
                        .map_err(anyhow::Error::from)?;
                    Ok(mark)
                })
                .await;
                match decoded {
                    Ok(mark) => Some(mark),
                    Err(err) => return err.into_outcome(),
                }
            }
        };

        let mut media = job.clone();
        media.inputs.retain(|f| f.field != WATERMARK_IMAGE_FIELD);
        let extensions: Vec<&str> = IMAGE_EXTENSIONS.iter().chain(VIDEO_EXTENSIONS).copied().collect();
        let items = collect_items(&media, None, &extensions).await?;
        let units = items
            .into_iter()
            .map(|item| (item.file_name.clone(), item))
            .collect();

        let ctx = Arc::new(MarkContext {
            ffmpeg: self.ffmpeg.clone(),
            settings,
            mark,
            mark_png,
            text_file,
        });
        run_units(&media, units, &archive_name(&media, "watermarked"), |item, out_dir| {
            watermark_one(ctx.clone(), item, out_dir)
        })
        .await
    }
}

async fn watermark_one(
    ctx: Arc<MarkContext>,
    item: BatchItem,
    out_dir: PathBuf,
) -> Result<Vec<OutputFile>, ItemError> {
    if IMAGE_EXTENSIONS.contains(&item.extension.as_str()) {
        let keep_jpeg = matches!(item.extension.as_str(), "jpg" | "jpeg");
        let output = OutputFile::named(
            &out_dir,
            &item.stem,
            "watermarked",
            if keep_jpeg { "jpg" } else { "png" },
        );
        if ctx.mark.is_some() {
            overlay_image(ctx, item, &output, keep_jpeg).await?;
        } else {
            let mut args = ffmpeg_input(&item);
            args.push("-vf".into());
            args.push(ctx.settings.drawtext_filter(&ctx.text_file).into());
            push_args(&mut args, &["-frames:v", "1"]);
            if keep_jpeg {
                push_args(&mut args, &["-q:v", "2"]);
            }
            args.push(output.path.clone().into_os_string());
            run_tool_on_item(&ctx.ffmpeg, args, || {
                format!("{} could not be watermarked", item.file_name)
            })
            .await?;
        }
        return Ok(vec![output]);
    }

    let output = OutputFile::named(&out_dir, &item.stem, "watermarked", "mp4");
    let mut args = ffmpeg_input(&item);
    match ctx.settings.kind {
        WatermarkKind::Text => {
            args.push("-vf".into());
            args.push(ctx.settings.drawtext_filter(&ctx.text_file).into());
            push_args(&mut args, &["-map", "0:v:0"]);
        }
        WatermarkKind::Image => {
            args.push("-i".into());
            args.push(ctx.mark_png.clone().into_os_string());
            args.push("-filter_complex".into());
            args.push(overlay_graph(&ctx.settings).into());
            push_args(&mut args, &["-map", "[out]"]);
        }
    }
    push_args(
        &mut args,
        &[
            "-map", "0:a?", "-c:v", "libx264", "-preset", "medium", "-crf", VIDEO_CRF, "-c:a", "aac",
            "-b:a", "192k", "-movflags", "+faststart",
        ],
    );
    args.push(output.path.clone().into_os_string());

    run_tool_on_item(&ctx.ffmpeg, args, || {
        format!("{} could not be watermarked", item.file_name)
    })
    .await?;
    Ok(vec![output])
}

fn ffmpeg_input(item: &BatchItem) -> Vec<OsString> {
    vec!["-y".into(), "-i".into(), item.path.clone().into_os_string()]
}

fn push_args(args: &mut Vec<OsString>, extra: &[&str]) {
    args.extend(extra.iter().map(OsString::from));
}

/// Scales the mark to at most 40% of the video width, then overlays it.
fn overlay_graph(settings: &WatermarkSettings) -> String {
    let (x, y) = settings
        .position
        .ffmpeg_expr(("main_w", "main_h"), ("overlay_w", "overlay_h"));
    format!(
        "[1:v][0:v]scale2ref=w='min(iw,main_w*0.4)':h='ow*ih/iw'[wm][base];[base][wm]overlay=x={}:y={}:format=auto[out]",
        x, y
    )
}

async fn overlay_image(
    ctx: Arc<MarkContext>,
    item: BatchItem,
    output: &OutputFile,
    keep_jpeg: bool,
) -> Result<(), ItemError> {
    let data = read_item(&item).await?;
    let path = output.path.clone();
    run_blocking(move || {
        let img = codec::decode(&data)
            .map_err(|_| ItemError::Rejected(format!("{} is not a recognized image", item.file_name)))?;
        let mark = ctx.mark.as_ref().context("Watermark image missing")?;
        let marked = Watermark::apply(&img, mark, &ctx.settings);
        let encoded = if keep_jpeg {
            codec::encode_jpeg(&marked, WATERMARKED_JPEG_QUALITY)?
        } else {
            codec::encode_png(&marked)?
        };
        std::fs::write(&path, encoded).map_err(anyhow::Error::from)?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use filegate_core::{FailureKind, OptionSchema, RawOptions, StagedFile};
    use image::{GenericImageView, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let mut buffer = Vec::new();
        RgbaImage::from_pixel(width, height, Rgba(color))
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn job(dir: &TempDir, files: &[(&str, &str, &str, Vec<u8>)], raw: &[(&str, &str)]) -> HandlerJob {
        let inputs = files
            .iter()
            .map(|(field, name, ext, data)| {
                let path = dir.path().join(name);
                std::fs::write(&path, data).unwrap();
                StagedFile {
                    field: field.to_string(),
                    path,
                    file_name: name.to_string(),
                    extension: ext.to_string(),
                    size: data.len() as u64,
                }
            })
            .collect();
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        let schema = OptionSchema::new()
            .with("type", "text")
            .with("text", "SAMPLE")
            .with("font_size", 48)
            .with("position", "middle-center")
            .with("transparency", 50)
            .with("rotation", 0)
            .with("bold", false);
        let raw: RawOptions = raw.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        HandlerJob {
            capability: "watermark-imgvideo".to_string(),
            inputs,
            options: schema.merge(&raw),
            work_dir,
        }
    }

    fn handler() -> WatermarkMediaHandler {
        WatermarkMediaHandler::new(ExternalTool::new("ffmpeg", "definitely-not-a-real-binary-filegate"))
    }

    #[tokio::test]
    async fn image_mark_is_composited_in_process() {
        let dir = TempDir::new().unwrap();
        let job = job(
            &dir,
            &[
                ("file", "photo.png", "png", png(200, 200, [255, 255, 255, 255])),
                (WATERMARK_IMAGE_FIELD, "logo.png", "png", png(40, 40, [0, 0, 0, 255])),
            ],
            &[("type", "image"), ("transparency", "100"), ("position", "top-left")],
        );

        let outcome = handler().process(job).await.unwrap();
        let artifact = match outcome {
            ProcessingOutcome::Artifact(a) => a,
            other => panic!("Expected artifact, got {:?}", other),
        };
        assert_eq!(artifact.file_name, "photo_watermarked.png");
        let img = image::load_from_memory(&artifact.data).unwrap();
        assert_eq!(img.dimensions(), (200, 200));
        assert_eq!(img.get_pixel(50, 50), Rgba([0, 0, 0, 255]));
        assert_eq!(img.get_pixel(150, 150), Rgba([255, 255, 255, 255]));
    }

    #[tokio::test]
    async fn image_type_without_mark_is_invalid() {
        let dir = TempDir::new().unwrap();
        let job = job(
            &dir,
            &[("file", "photo.png", "png", png(10, 10, [255, 255, 255, 255]))],
            &[("type", "image")],
        );
        match handler().process(job).await.unwrap() {
            ProcessingOutcome::Failure(f) => assert_eq!(f.kind, FailureKind::InvalidInput),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn text_mark_needs_ffmpeg() {
        let dir = TempDir::new().unwrap();
        let job = job(
            &dir,
            &[("file", "photo.png", "png", png(10, 10, [255, 255, 255, 255]))],
            &[("text", "DRAFT")],
        );
        let work_dir = job.work_dir.clone();
        // The tool is missing, so the single item fails the job.
        assert!(handler().process(job).await.is_err());
        assert_eq!(std::fs::read_to_string(work_dir.join("watermark.txt")).unwrap(), "DRAFT");
    }

    #[test]
    fn overlay_graph_positions_mark() {
        let settings = WatermarkSettings {
            kind: WatermarkKind::Image,
            text: String::new(),
            font_size: 48,
            bold: false,
            position: crate::watermark::Position::parse("bottom-right"),
            opacity: 0.5,
            rotation: 0.0,
        };
        let graph = overlay_graph(&settings);
        assert!(graph.starts_with("[1:v][0:v]scale2ref="));
        assert!(graph.contains("overlay=x=main_w-overlay_w-40:y=main_h-overlay_h-40"));
        assert!(graph.ends_with("[out]"));
    }
}
