//! qpdf encryption and decryption, and PDF to Word through LibreOffice.

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use filegate_core::{ProcessingFailure, ProcessingOutcome};

use super::office::Office;
use super::PDF_EXTENSIONS;
use crate::batch::{collect_items, run_batch, BatchItem, ItemError, OutputFile};
use crate::tools::{stderr_tail, ExternalTool};
use crate::traits::{CapabilityHandler, HandlerJob};

/// qpdf exit status for "succeeded with warnings".
const QPDF_EXIT_WARNINGS: i32 = 3;

/// Runs qpdf on one item. Warnings still count as success; a password
/// problem or an unreadable file rejects the item.
async fn run_qpdf(qpdf: &ExternalTool, item: &BatchItem, args: Vec<OsString>) -> Result<(), ItemError> {
    let output = qpdf.run_unchecked(args).await?;
    match output.status.code() {
        Some(0) | Some(QPDF_EXIT_WARNINGS) => Ok(()),
        _ => {
            let stderr = stderr_tail(&output.stderr);
            tracing::warn!(file = %item.file_name, status = %output.status, stderr = %stderr, "qpdf rejected input");
            if stderr.to_lowercase().contains("password") {
                Err(ItemError::Rejected(format!(
                    "Password required or incorrect for {}",
                    item.file_name
                )))
            } else {
                Err(ItemError::Rejected(format!("{} is not a valid PDF", item.file_name)))
            }
        }
    }
}

/// `protect-pdf`: AES-256 with the same user and owner password.
pub struct ProtectPdfHandler {
    qpdf: ExternalTool,
}

impl ProtectPdfHandler {
    pub fn new(qpdf: ExternalTool) -> Self {
        Self { qpdf }
    }
}

#[async_trait]
impl CapabilityHandler for ProtectPdfHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let Some(password) = job.options.get_str("password") else {
            return Ok(ProcessingFailure::invalid_input("Password is required").into());
        };

        let items = collect_items(&job, None, PDF_EXTENSIONS).await?;
        run_batch(&job, items, "protected", |item, out_dir| {
            protect_one(&self.qpdf, item, out_dir, password.clone())
        })
        .await
    }
}

async fn protect_one(
    qpdf: &ExternalTool,
    item: BatchItem,
    out_dir: PathBuf,
    password: String,
) -> Result<Vec<OutputFile>, ItemError> {
    let output = OutputFile::named(&out_dir, &item.stem, "protected", "pdf");
    let args = vec![
        OsString::from("--encrypt"),
        password.clone().into(),
        password.into(),
        "256".into(),
        "--".into(),
        item.path.clone().into_os_string(),
        output.path.clone().into_os_string(),
    ];
    run_qpdf(qpdf, &item, args).await?;
    Ok(vec![output])
}

/// `unlock-pdf`: removes encryption, given the right password.
pub struct UnlockPdfHandler {
    qpdf: ExternalTool,
}

impl UnlockPdfHandler {
    pub fn new(qpdf: ExternalTool) -> Self {
        Self { qpdf }
    }
}

#[async_trait]
impl CapabilityHandler for UnlockPdfHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        // No password is valid: some files only carry an owner password.
        let password = job.options.get_str("password").unwrap_or_default();
        let items = collect_items(&job, None, PDF_EXTENSIONS).await?;
        run_batch(&job, items, "unlocked", |item, out_dir| {
            unlock_one(&self.qpdf, item, out_dir, password.clone())
        })
        .await
    }
}

async fn unlock_one(
    qpdf: &ExternalTool,
    item: BatchItem,
    out_dir: PathBuf,
    password: String,
) -> Result<Vec<OutputFile>, ItemError> {
    let output = OutputFile::named(&out_dir, &item.stem, "unlocked", "pdf");
    let args = vec![
        OsString::from(format!("--password={}", password)),
        "--decrypt".into(),
        item.path.clone().into_os_string(),
        output.path.clone().into_os_string(),
    ];
    run_qpdf(qpdf, &item, args).await?;
    Ok(vec![output])
}

/// `pdf-to-word`: LibreOffice's PDF import, saved as docx.
pub struct PdfToWordHandler {
    office: Office,
}

impl PdfToWordHandler {
    pub fn new(soffice: ExternalTool) -> Self {
        Self {
            office: Office::new(soffice),
        }
    }
}

#[async_trait]
impl CapabilityHandler for PdfToWordHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let profile = job.work_dir.join("office-profile");
        let items = collect_items(&job, None, PDF_EXTENSIONS).await?;
        run_batch(&job, items, "docx", |item, out_dir| {
            let office = &self.office;
            let profile = profile.clone();
            async move {
                let output = OutputFile::plain(&out_dir, &item.stem, "docx");
                office
                    .convert_to(&item, &output, "docx:MS Word 2007 XML", Some("writer_pdf_import"), &profile)
                    .await?;
                Ok::<_, ItemError>(vec![output])
            }
        })
        .await
    }
}
