//! `download-audio-batch`: audio tracks from links (yt-dlp) or from uploaded
//! videos (ffmpeg).

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use filegate_core::{ProcessingFailure, ProcessingOutcome};

use crate::batch::{collect_items, run_tool_on_item, run_units, BatchItem, ItemError, OutputFile};
use crate::download::{requested_urls, Downloader, URL_LIST_EXTENSIONS};
use crate::mime::VIDEO_EXTENSIONS;
use crate::tools::ExternalTool;
use crate::traits::{CapabilityHandler, HandlerJob};

const AUDIO_BITRATE: &str = "192k";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    M4a,
    Opus,
    Wav,
    Flac,
}

impl AudioFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "m4a" | "aac" => Some(AudioFormat::M4a),
            "opus" => Some(AudioFormat::Opus),
            "wav" => Some(AudioFormat::Wav),
            "flac" => Some(AudioFormat::Flac),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Opus => "opus",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
        }
    }

    /// ffmpeg audio arguments: codec, plus a bitrate for lossy formats.
    fn codec_args(self) -> Vec<&'static str> {
        let codec = match self {
            AudioFormat::Mp3 => "libmp3lame",
            AudioFormat::M4a => "aac",
            AudioFormat::Opus => "libopus",
            AudioFormat::Wav => "pcm_s16le",
            AudioFormat::Flac => "flac",
        };
        let mut args = vec!["-c:a", codec];
        if !matches!(self, AudioFormat::Wav | AudioFormat::Flac) {
            args.extend(["-b:a", AUDIO_BITRATE]);
        }
        args
    }
}

enum AudioSource {
    Link(String),
    Video(BatchItem),
}

pub struct DownloadAudioHandler {
    downloader: Arc<Downloader>,
    ffmpeg: ExternalTool,
}

impl DownloadAudioHandler {
    pub fn new(ytdlp: ExternalTool, ffmpeg: ExternalTool) -> Self {
        Self {
            downloader: Arc::new(Downloader::new(ytdlp, ffmpeg.clone())),
            ffmpeg,
        }
    }
}

#[async_trait]
impl CapabilityHandler for DownloadAudioHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let raw_format = job.options.get_keyword("format").unwrap_or_else(|| "mp3".to_string());
        let Some(format) = AudioFormat::parse(&raw_format) else {
            return Ok(ProcessingFailure::invalid_input(format!(
                "Invalid format '{}'. Allowed values: mp3, m4a, opus, wav, flac",
                raw_format
            ))
            .into());
        };

        let mut units: Vec<(String, AudioSource)> = collect_items(&job, None, VIDEO_EXTENSIONS)
            .await?
            .into_iter()
            .map(|item| (item.file_name.clone(), AudioSource::Video(item)))
            .collect();

        let wants_links = job.options.get_keyword("url").is_some()
            || job
                .inputs
                .iter()
                .any(|f| URL_LIST_EXTENSIONS.contains(&f.extension.as_str()));
        if wants_links || units.is_empty() {
            match requested_urls(&job).await {
                Ok(urls) => units.extend(urls.into_iter().map(|url| (url.clone(), AudioSource::Link(url)))),
                Err(err) => return err.into_outcome(),
            }
        }

        let format_args = ["-x", "--audio-format", format.extension(), "--audio-quality", "192K"];
        run_units(&job, units, "audio.zip", |source, out_dir| {
            let downloader = self.downloader.clone();
            let ffmpeg = self.ffmpeg.clone();
            async move {
                match source {
                    AudioSource::Link(url) => downloader.fetch(&url, out_dir, &format_args).await,
                    AudioSource::Video(item) => extract_one(&ffmpeg, item, out_dir, format).await,
                }
            }
        })
        .await
    }
}

async fn extract_one(
    ffmpeg: &ExternalTool,
    item: BatchItem,
    out_dir: PathBuf,
    format: AudioFormat,
) -> Result<Vec<OutputFile>, ItemError> {
    let output = OutputFile::plain(&out_dir, &item.stem, format.extension());
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        item.path.clone().into_os_string(),
        "-vn".into(),
    ];
    args.extend(format.codec_args().into_iter().map(OsString::from));
    args.push(output.path.clone().into_os_string());

    run_tool_on_item(ffmpeg, args, || {
        format!("{} has no audio track that could be extracted", item.file_name)
    })
    .await?;
    Ok(vec![output])
}
