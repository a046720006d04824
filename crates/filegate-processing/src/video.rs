//! Video capabilities: ffmpeg upscaling and yt-dlp downloads.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use filegate_core::{ProcessingFailure, ProcessingOutcome};

use crate::batch::{collect_items, run_batch, run_tool_on_item, run_units, BatchItem, ItemError, OutputFile};
use crate::download::{requested_urls, Downloader};
use crate::mime::VIDEO_EXTENSIONS;
use crate::tools::ExternalTool;
use crate::traits::{CapabilityHandler, HandlerJob};

/// Largest output side ffmpeg is asked to produce.
const MAX_OUTPUT_SIDE: u32 = 7680;
const MAX_CRF: u32 = 51;
const DEFAULT_CRF: u32 = 18;

/// Requested output size for `video-upscale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoScale {
    /// `2x`, `4x`
    Factor(u32),
    /// `WIDTH:HEIGHT`
    Exact(u32, u32),
}

impl VideoScale {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        if let Some(factor) = s.strip_suffix('x') {
            return match factor {
                "2" => Some(VideoScale::Factor(2)),
                "4" => Some(VideoScale::Factor(4)),
                _ => None,
            };
        }
        let (w, h) = s.split_once(':')?;
        let (w, h) = (w.parse::<u32>().ok()?, h.parse::<u32>().ok()?);
        let valid = |side: u32| (2..=MAX_OUTPUT_SIDE).contains(&side) && side % 2 == 0;
        (valid(w) && valid(h)).then_some(VideoScale::Exact(w, h))
    }

    /// Output size for a source of `width` x `height`.
    pub fn output_size(self, width: u32, height: u32) -> (u64, u64) {
        match self {
            VideoScale::Factor(n) => (width as u64 * n as u64, height as u64 * n as u64),
            VideoScale::Exact(w, h) => (w as u64, h as u64),
        }
    }

    pub fn filter(self) -> String {
        match self {
            VideoScale::Factor(n) => format!("scale=iw*{n}:ih*{n}:flags=lanczos"),
            VideoScale::Exact(w, h) => format!("scale={w}:{h}:flags=lanczos"),
        }
    }
}

/// Parses ffprobe's `width,height` csv line.
fn parse_dimensions(stdout: &[u8]) -> Option<(u32, u32)> {
    let text = String::from_utf8_lossy(stdout);
    let line = text.lines().find(|l| !l.trim().is_empty())?;
    let (w, h) = line.trim().trim_end_matches(',').split_once(',')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// `video-upscale`: ffmpeg Lanczos scaling, re-encoded with libx264.
pub struct VideoUpscaleHandler {
    ffmpeg: ExternalTool,
    ffprobe: ExternalTool,
}

impl VideoUpscaleHandler {
    pub fn new(ffmpeg: ExternalTool, ffprobe: ExternalTool) -> Self {
        Self { ffmpeg, ffprobe }
    }
}

#[async_trait]
impl CapabilityHandler for VideoUpscaleHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let raw_scale = job.options.get_keyword("scale").unwrap_or_else(|| "2x".to_string());
        let Some(scale) = VideoScale::parse(&raw_scale) else {
            return Ok(ProcessingFailure::invalid_input(format!(
                "Invalid scale '{}'. Use 2x, 4x or WIDTH:HEIGHT",
                raw_scale
            ))
            .into());
        };
        let crf = match job.options.get_u32("crf").unwrap_or(DEFAULT_CRF) {
            crf if crf <= MAX_CRF => crf,
            _ => {
                return Ok(ProcessingFailure::invalid_input(format!(
                    "Invalid crf. Allowed values: 0-{}",
                    MAX_CRF
                ))
                .into())
            }
        };

        let items = collect_items(&job, None, VIDEO_EXTENSIONS).await?;
        run_batch(&job, items, "upscaled", |item, out_dir| {
            upscale_one(&self.ffmpeg, &self.ffprobe, item, out_dir, scale, crf)
        })
        .await
    }
}

async fn upscale_one(
    ffmpeg: &ExternalTool,
    ffprobe: &ExternalTool,
    item: BatchItem,
    out_dir: PathBuf,
    scale: VideoScale,
    crf: u32,
) -> Result<Vec<OutputFile>, ItemError> {
    let not_a_video = || format!("{} is not a valid video", item.file_name);
    let probe = run_tool_on_item(
        ffprobe,
        [
            OsString::from("-v"),
            "error".into(),
            "-select_streams".into(),
            "v:0".into(),
            "-show_entries".into(),
            "stream=width,height".into(),
            "-of".into(),
            "csv=p=0".into(),
            item.path.clone().into_os_string(),
        ],
        not_a_video,
    )
    .await?;
    let (width, height) = parse_dimensions(&probe).ok_or_else(|| ItemError::Rejected(not_a_video()))?;

    let (out_w, out_h) = scale.output_size(width, height);
    if out_w > MAX_OUTPUT_SIDE as u64 || out_h > MAX_OUTPUT_SIDE as u64 {
        return Err(ItemError::Rejected(format!(
            "{} is too large to upscale ({}x{} would become {}x{})",
            item.file_name, width, height, out_w, out_h
        )));
    }
    tracing::debug!(file = %item.file_name, width, height, out_w, out_h, "Upscaling video");

    let output = OutputFile::named(&out_dir, &item.stem, "upscaled", "mp4");
    ffmpeg
        .run([
            OsString::from("-y"),
            "-i".into(),
            item.path.clone().into_os_string(),
            "-vf".into(),
            scale.filter().into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "medium".into(),
            "-crf".into(),
            crf.to_string().into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "192k".into(),
            "-movflags".into(),
            "+faststart".into(),
            output.path.clone().into_os_string(),
        ])
        .await?;

    Ok(vec![output])
}

const VIDEO_FORMAT_ARGS: [&str; 4] = [
    "-f",
    "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best",
    "--merge-output-format",
    "mp4",
];

/// `download-video-batch`: every requested link downloaded as mp4.
pub struct DownloadVideoHandler {
    downloader: Arc<Downloader>,
}

impl DownloadVideoHandler {
    pub fn new(ytdlp: ExternalTool, ffmpeg: ExternalTool) -> Self {
        Self {
            downloader: Arc::new(Downloader::new(ytdlp, ffmpeg)),
        }
    }
}

#[async_trait]
impl CapabilityHandler for DownloadVideoHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let urls = match requested_urls(&job).await {
            Ok(urls) => urls,
            Err(err) => return err.into_outcome(),
        };
        tracing::info!(count = urls.len(), "Downloading videos");

        let units = urls.into_iter().map(|url| (url.clone(), url)).collect();
        run_units(&job, units, "videos.zip", |url, out_dir| {
            let downloader = self.downloader.clone();
            async move { downloader.fetch(&url, out_dir, &VIDEO_FORMAT_ARGS).await }
        })
        .await
    }
}
