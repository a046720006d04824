//! LibreOffice conversions: `file-pdf` and `convert-all-to-ppt`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use filegate_core::ProcessingOutcome;

use crate::batch::{collect_items, run_tool_on_item, run_units, BatchItem, ItemError, OutputFile};
use crate::tools::ExternalTool;
use crate::traits::{CapabilityHandler, HandlerJob};

pub const FILE_PDF_EXTENSIONS: &[&str] = &[
    "doc", "docx", "odt", "rtf", "txt", "html", "htm", "xls", "xlsx", "ppt", "pptx", "jpg", "jpeg",
    "png",
];
pub const PPT_SOURCE_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "ppt", "odp", "txt", "jpg", "jpeg", "png",
];
/// Inputs LibreOffice Impress opens directly.
const PRESENTATION_EXTENSIONS: &[&str] = &["ppt", "pptx", "odp"];

/// Headless `soffice` with a profile private to one request, so concurrent
/// conversions never contend for the same user installation.
#[derive(Debug, Clone)]
pub struct Office {
    soffice: ExternalTool,
}

impl Office {
    pub fn new(soffice: ExternalTool) -> Self {
        Self { soffice }
    }

    /// Converts `input` into `out_dir`. `target` is a LibreOffice filter
    /// spec such as `pdf` or `docx:MS Word 2007 XML`. Returns the produced
    /// file.
    pub async fn convert(
        &self,
        input: &Path,
        out_dir: &Path,
        target: &str,
        import_filter: Option<&str>,
        profile_dir: &Path,
    ) -> Result<PathBuf, ItemError> {
        let extension = target.split(':').next().unwrap_or(target);
        let stem = input
            .file_stem()
            .context("Input file has no name")?
            .to_string_lossy()
            .into_owned();
        let display_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| stem.clone());

        let mut args: Vec<OsString> = vec![
            "--headless".into(),
            "--norestore".into(),
            format!("-env:UserInstallation={}", file_url(profile_dir)).into(),
        ];
        if let Some(filter) = import_filter {
            args.push(format!("--infilter={}", filter).into());
        }
        args.extend([
            OsString::from("--convert-to"),
            target.into(),
            "--outdir".into(),
            out_dir.as_os_str().to_owned(),
            input.as_os_str().to_owned(),
        ]);

        run_tool_on_item(&self.soffice, args, || {
            format!("{} could not be converted to {}", display_name, extension)
        })
        .await?;

        // soffice exits 0 even when it silently skips a file.
        let produced = out_dir.join(format!("{}.{}", stem, extension));
        if !tokio::fs::try_exists(&produced).await.unwrap_or(false) {
            return Err(ItemError::Rejected(format!(
                "{} could not be converted to {}",
                display_name, extension
            )));
        }
        Ok(produced)
    }

    /// [`Office::convert`] into the exact location of `output`.
    pub async fn convert_to(
        &self,
        item: &BatchItem,
        output: &OutputFile,
        target: &str,
        import_filter: Option<&str>,
        profile_dir: &Path,
    ) -> Result<(), ItemError> {
        let out_dir = output.path.parent().context("Output has no directory")?;
        let produced = self
            .convert(&item.path, out_dir, target, import_filter, profile_dir)
            .await?;
        if produced != output.path {
            tokio::fs::rename(&produced, &output.path)
                .await
                .context("Failed to move converted file")?;
        }
        Ok(())
    }
}

/// `file://` URL for a local directory, as `-env:UserInstallation` expects.
fn file_url(path: &Path) -> String {
    let display = path.to_string_lossy().replace('\\', "/").replace(' ', "%20");
    if display.starts_with('/') {
        format!("file://{}", display)
    } else {
        format!("file:///{}", display)
    }
}

fn profile_dir(job: &HandlerJob) -> PathBuf {
    job.work_dir.join("office-profile")
}

/// `file-pdf`: office documents, text and images to PDF.
pub struct FileToPdfHandler {
    office: Office,
}

impl FileToPdfHandler {
    pub fn new(soffice: ExternalTool) -> Self {
        Self {
            office: Office::new(soffice),
        }
    }
}

#[async_trait]
impl CapabilityHandler for FileToPdfHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let profile = profile_dir(&job);
        let units = labelled(collect_items(&job, None, FILE_PDF_EXTENSIONS).await?);
        run_units(&job, units, "converted_pdfs.zip", |item, out_dir| {
            let office = &self.office;
            let profile = profile.clone();
            async move {
                let output = OutputFile::plain(&out_dir, &item.stem, "pdf");
                office.convert_to(&item, &output, "pdf", None, &profile).await?;
                Ok::<_, ItemError>(vec![output])
            }
        })
        .await
    }
}

/// `convert-all-to-ppt`: presentations are re-saved as pptx; everything else
/// goes through PDF and is imported into Impress, one slide per page.
pub struct ConvertToPptHandler {
    office: Office,
}

impl ConvertToPptHandler {
    pub fn new(soffice: ExternalTool) -> Self {
        Self {
            office: Office::new(soffice),
        }
    }
}

#[async_trait]
impl CapabilityHandler for ConvertToPptHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let profile = profile_dir(&job);
        let units = labelled(collect_items(&job, None, PPT_SOURCE_EXTENSIONS).await?);
        run_units(&job, units, "converted_ppts.zip", |item, out_dir| {
            to_pptx(&self.office, item, out_dir, profile.clone())
        })
        .await
    }
}

async fn to_pptx(
    office: &Office,
    item: BatchItem,
    out_dir: PathBuf,
    profile: PathBuf,
) -> Result<Vec<OutputFile>, ItemError> {
    let output = OutputFile::plain(&out_dir, &item.stem, "pptx");
    let ext = item.extension.as_str();

    if PRESENTATION_EXTENSIONS.contains(&ext) {
        office.convert_to(&item, &output, "pptx", None, &profile).await?;
    } else if ext == "pdf" {
        office
            .convert_to(&item, &output, "pptx", Some("impress_pdf_import"), &profile)
            .await?;
    } else {
        let pdf_dir = out_dir.join("pdf");
        tokio::fs::create_dir_all(&pdf_dir)
            .await
            .context("Failed to create conversion directory")?;
        let pdf = office.convert(&item.path, &pdf_dir, "pdf", None, &profile).await?;
        let produced = office
            .convert(&pdf, &out_dir, "pptx", Some("impress_pdf_import"), &profile)
            .await?;
        if produced != output.path {
            tokio::fs::rename(&produced, &output.path)
                .await
                .context("Failed to move converted file")?;
        }
    }

    Ok(vec![output])
}

fn labelled(items: Vec<BatchItem>) -> Vec<(String, BatchItem)> {
    items
        .into_iter()
        .map(|item| (item.file_name.clone(), item))
        .collect()
}
