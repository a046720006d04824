//! Link downloads shared by the video and audio capabilities.
//!
//! Links come from the `url` option and from uploaded text documents. Every
//! `http://` or `https://` token in a document is taken, in order, once.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::batch::{
    outputs_in_dir, read_member_bounded, run_blocking, run_tool_on_item, ItemError, OutputFile,
    MAX_IN_MEMORY_EXPANSION_BYTES,
};
use crate::tools::ExternalTool;
use crate::traits::HandlerJob;

/// Documents links are read from.
#[cfg(feature = "document")]
pub const URL_LIST_EXTENSIONS: &[&str] = &["txt", "docx", "pdf"];
#[cfg(not(feature = "document"))]
pub const URL_LIST_EXTENSIONS: &[&str] = &["txt", "docx"];

const SCHEMES: [&str; 2] = ["https://", "http://"];

pub fn is_http_url(candidate: &str) -> bool {
    SCHEMES.iter().any(|scheme| {
        candidate
            .strip_prefix(scheme)
            .is_some_and(|rest| !rest.is_empty() && !rest.contains(char::is_whitespace))
    })
}

/// All distinct links in `text`, in order of first appearance.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for token in text.split(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>')) {
        let Some(start) = SCHEMES.iter().filter_map(|s| token.find(s)).min() else {
            continue;
        };
        let url = token[start..].trim_end_matches(['.', ',', ';', ')', ']']);
        if is_http_url(url) && seen.insert(url.to_string()) {
            urls.push(url.to_string());
        }
    }

    urls
}

/// Links requested by a job: the `url` option first, then every uploaded
/// link document. A malformed `url` option or an unreadable document rejects
/// the job; finding no link at all does too.
pub async fn requested_urls(job: &HandlerJob) -> std::result::Result<Vec<String>, ItemError> {
    let mut urls = Vec::new();

    if let Some(url) = job.options.get_keyword("url") {
        if !is_http_url(&url) {
            return Err(ItemError::Rejected(format!(
                "Invalid url '{}'. Only http and https links are supported",
                url
            )));
        }
        urls.push(url);
    }

    for input in job
        .inputs
        .iter()
        .filter(|f| URL_LIST_EXTENSIONS.contains(&f.extension.as_str()))
    {
        let path = input.path.clone();
        let extension = input.extension.clone();
        let name = input.file_name.clone();
        let text = run_blocking(move || {
            document_text(&path, &extension)
                .map_err(|_| ItemError::Rejected(format!("Could not read links from {}", name)))
        })
        .await?;
        for url in extract_urls(&text) {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }

    if urls.is_empty() {
        return Err(ItemError::Rejected(
            "No links provided. Send a url option or a document listing links".to_string(),
        ));
    }

    Ok(urls)
}

fn document_text(path: &Path, extension: &str) -> Result<String> {
    match extension {
        "docx" => docx_text(path, MAX_IN_MEMORY_EXPANSION_BYTES),
        #[cfg(feature = "document")]
        "pdf" => pdf_text(path),
        _ => {
            let data = std::fs::read(path)?;
            Ok(String::from_utf8_lossy(&data).into_owned())
        }
    }
}

/// Raw markup of the body and its relationships. Links typed as text live in
/// the body, hyperlink targets in the relationships. Both parts together are
/// read up to `budget` bytes.
fn docx_text(path: &Path, mut budget: u64) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut zip = zip::ZipArchive::new(file).context("Not a valid docx package")?;
    let mut text = String::new();

    for part in ["word/document.xml", "word/_rels/document.xml.rels"] {
        if let Ok(mut entry) = zip.by_name(part) {
            let contents = read_member_bounded(&mut entry, part, &mut budget)?;
            text.push_str(&String::from_utf8_lossy(&contents));
            text.push('\n');
        }
    }

    Ok(text.replace("&amp;", "&"))
}

#[cfg(feature = "document")]
fn pdf_text(path: &Path) -> Result<String> {
    let doc = lopdf::Document::load(path).context("Not a valid PDF")?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    doc.extract_text(&pages).context("Failed to extract PDF text")
}

/// yt-dlp invocation shared by the video and audio downloads.
#[derive(Debug, Clone)]
pub(crate) struct Downloader {
    ytdlp: ExternalTool,
    ffmpeg: ExternalTool,
}

impl Downloader {
    pub(crate) fn new(ytdlp: ExternalTool, ffmpeg: ExternalTool) -> Self {
        Self { ytdlp, ffmpeg }
    }

    /// Downloads `url` into `out_dir` with the given format arguments and
    /// returns whatever yt-dlp wrote there.
    pub(crate) async fn fetch(
        &self,
        url: &str,
        out_dir: PathBuf,
        format_args: &[&str],
    ) -> Result<Vec<OutputFile>, ItemError> {
        let mut args: Vec<OsString> = vec![
            "--no-playlist".into(),
            "--no-progress".into(),
            "--restrict-filenames".into(),
        ];
        // A bare program name is left to yt-dlp's own lookup.
        if self.ffmpeg.program().contains(std::path::MAIN_SEPARATOR) {
            args.push("--ffmpeg-location".into());
            args.push(self.ffmpeg.program().into());
        }
        args.extend(format_args.iter().map(OsString::from));
        args.push("-o".into());
        args.push(out_dir.join("%(title).100s.%(ext)s").into_os_string());
        args.push("--".into());
        args.push(url.into());

        run_tool_on_item(&self.ytdlp, args, || format!("Could not download {}", url)).await?;

        let files = outputs_in_dir(&out_dir).await?;
        if files.is_empty() {
            return Err(ItemError::Rejected(format!("Nothing was downloaded from {}", url)));
        }
        Ok(files)
    }
}
