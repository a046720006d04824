//! Batch handling shared by the capability handlers.
//!
//! Inputs are either plain staged files or ZIP archives whose members are
//! expanded into the job's work directory. Each item is processed into its own
//! output directory, and the results are returned either as a single file or
//! as one ZIP archive.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::future::Future;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use filegate_core::sanitize::sanitize;
use filegate_core::{Artifact, ProcessingFailure, ProcessingOutcome, StagedFile};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

use crate::mime::mime_for_extension;
use crate::tools::{stderr_tail, ExternalTool};
use crate::traits::HandlerJob;

/// Upper bound on the uncompressed bytes expanded out of the uploaded archives
/// of one request.
pub const MAX_ARCHIVE_EXPANSION_BYTES: u64 = 2 * 1024 * 1024 * 1024;
pub const MAX_ARCHIVE_MEMBERS: usize = 1000;
/// Upper bound on the uncompressed bytes a handler reads into memory out of
/// one container document (OOXML package, docx link list).
pub const MAX_IN_MEMORY_EXPANSION_BYTES: u64 = 256 * 1024 * 1024;

/// One unit of work: a staged upload or an archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub path: PathBuf,
    pub file_name: String,
    pub stem: String,
    pub extension: String,
}

impl BatchItem {
    fn from_name(path: PathBuf, file_name: String, extension: String) -> Self {
        let stem = if extension.is_empty() {
            file_name.clone()
        } else {
            file_name[..file_name.len() - extension.len() - 1].to_string()
        };
        Self {
            path,
            file_name,
            stem,
            extension,
        }
    }
}

impl From<&StagedFile> for BatchItem {
    fn from(file: &StagedFile) -> Self {
        BatchItem::from_name(file.path.clone(), file.file_name.clone(), file.extension.clone())
    }
}

/// A produced file, ready to be returned.
#[derive(Debug, Clone)]
pub struct OutputFile {
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: String,
}

impl OutputFile {
    /// `<dir>/<stem>_<suffix>.<ext>` with the MIME type derived from `ext`.
    pub fn named(dir: &Path, stem: &str, suffix: &str, ext: &str) -> Self {
        let file_name = format!("{}_{}.{}", stem, suffix, ext);
        Self {
            path: dir.join(&file_name),
            mime_type: mime_for_extension(ext).to_string(),
            file_name,
        }
    }

    /// `<dir>/<stem>.<ext>`, for conversions that only change the format.
    pub fn plain(dir: &Path, stem: &str, ext: &str) -> Self {
        let file_name = format!("{}.{}", stem, ext);
        Self {
            path: dir.join(&file_name),
            mime_type: mime_for_extension(ext).to_string(),
            file_name,
        }
    }
}

/// Why a single item could not be processed.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    /// The input itself is unusable (corrupt image, wrong password, ...).
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ItemError {
    /// The job outcome when this error ends the whole job.
    pub fn into_outcome(self) -> Result<ProcessingOutcome> {
        match self {
            ItemError::Rejected(msg) => Ok(ProcessingFailure::invalid_input(msg).into()),
            ItemError::Failed(err) => Err(err),
        }
    }
}

/// Reads one archive member into memory, charging what it expands to against
/// `budget`. The declared size in the member header is not trusted.
pub fn read_member_bounded<R: Read>(
    entry: &mut R,
    name: &str,
    budget: &mut u64,
) -> std::result::Result<Vec<u8>, ItemError> {
    let mut contents = Vec::new();
    (&mut *entry)
        .take(budget.saturating_add(1))
        .read_to_end(&mut contents)
        .with_context(|| format!("Failed to read {}", name))?;
    let read = contents.len() as u64;
    if read > *budget {
        return Err(ItemError::Rejected(format!(
            "{} expands beyond the allowed size",
            name
        )));
    }
    *budget -= read;
    Ok(contents)
}

pub async fn read_item(item: &BatchItem) -> std::result::Result<Vec<u8>, ItemError> {
    tokio::fs::read(&item.path)
        .await
        .with_context(|| format!("Failed to read {}", item.file_name))
        .map_err(ItemError::Failed)
}

/// Runs CPU-bound work off the async workers. A panic inside `f` surfaces as
/// `ItemError::Failed`.
pub async fn run_blocking<T, F>(f: F) -> std::result::Result<T, ItemError>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, ItemError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ItemError::Failed(anyhow::anyhow!("Processing task failed: {}", e)))?
}

/// Expands the job's inputs into batch items. ZIP uploads contribute their
/// members whose extension is in `member_extensions`; other uploads are used
/// as-is when their extension is in that list. Inputs from other fields are
/// left to the handler.
pub async fn collect_items(
    job: &HandlerJob,
    field: Option<&str>,
    member_extensions: &[&str],
) -> Result<Vec<BatchItem>> {
    let mut items = Vec::new();
    let mut budget = MAX_ARCHIVE_EXPANSION_BYTES;

    for (idx, input) in job.inputs.iter().enumerate() {
        if field.is_some_and(|f| f != input.field) {
            continue;
        }
        if input.extension == "zip" {
            let dest = job.work_dir.join(format!("unzipped-{}", idx));
            let archive = input.path.clone();
            let allowed: Vec<String> = member_extensions.iter().map(|e| e.to_string()).collect();
            let (members, used) = tokio::task::spawn_blocking(move || {
                expand_archive(&archive, &dest, &allowed, budget)
            })
            .await
            .context("Archive expansion task failed")??;
            budget = budget.saturating_sub(used);
            items.extend(members);
        } else if member_extensions.contains(&input.extension.as_str()) {
            items.push(BatchItem::from(input));
        }
    }

    Ok(items)
}

/// Expands the accepted members of one archive into `dest`. Returns the items
/// and the number of bytes written.
fn expand_archive(
    archive: &Path,
    dest: &Path,
    allowed: &[String],
    budget: u64,
) -> Result<(Vec<BatchItem>, u64)> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("Uploaded file is not a valid ZIP archive")?;
    std::fs::create_dir_all(dest).context("Failed to create archive extraction directory")?;

    let mut items = Vec::new();
    let mut used: u64 = 0;
    let mut seen = HashSet::new();

    for i in 0..zip.len() {
        if items.len() >= MAX_ARCHIVE_MEMBERS {
            tracing::warn!(archive = %archive.display(), "Archive member limit reached");
            break;
        }
        let mut entry = zip.by_index(i).context("Failed to read archive entry")?;
        if entry.is_dir() {
            continue;
        }
        // Only the basename of a member is ever used.
        let raw_name = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        if raw_name.is_empty() {
            continue;
        }
        let sanitized = sanitize(&raw_name);
        if !allowed.iter().any(|e| *e == sanitized.extension) {
            continue;
        }

        let mut file_name = sanitized.safe_name.clone();
        let mut n = 1;
        while !seen.insert(file_name.clone()) {
            file_name = format!("{}-{}", n, sanitized.safe_name);
            n += 1;
        }

        let remaining = budget.saturating_sub(used);
        let path = dest.join(&file_name);
        let mut out = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let written = std::io::copy(&mut (&mut entry).take(remaining + 1), &mut out)
            .with_context(|| format!("Failed to extract {}", raw_name))?;
        if written > remaining {
            anyhow::bail!("Archive expands beyond {} bytes", budget);
        }
        used += written;

        items.push(BatchItem::from_name(path, file_name, sanitized.extension));
    }

    Ok((items, used))
}

/// Runs `process` once per item, each with its own output directory.
///
/// With a single item its failure is the job's failure: `Rejected` becomes
/// `InvalidInput`, anything else propagates as a crash. With several items a
/// failing item is logged and skipped.
pub async fn run_batch<F, Fut>(
    job: &HandlerJob,
    items: Vec<BatchItem>,
    suffix: &str,
    process: F,
) -> Result<ProcessingOutcome>
where
    F: FnMut(BatchItem, PathBuf) -> Fut,
    Fut: Future<Output = std::result::Result<Vec<OutputFile>, ItemError>>,
{
    let units = items
        .into_iter()
        .map(|item| (item.file_name.clone(), item))
        .collect();
    run_units(job, units, &archive_name(job, suffix), process).await
}

/// [`run_batch`] over arbitrary work units, each labelled for logging.
pub async fn run_units<T, F, Fut>(
    job: &HandlerJob,
    units: Vec<(String, T)>,
    archive_name: &str,
    mut process: F,
) -> Result<ProcessingOutcome>
where
    F: FnMut(T, PathBuf) -> Fut,
    Fut: Future<Output = std::result::Result<Vec<OutputFile>, ItemError>>,
{
    if units.is_empty() {
        return Ok(no_processable_files());
    }

    let single = units.len() == 1;
    let mut outputs = Vec::new();
    let mut skipped = Vec::new();

    for (idx, (label, unit)) in units.into_iter().enumerate() {
        let out_dir = job.work_dir.join("out").join(idx.to_string());
        tokio::fs::create_dir_all(&out_dir)
            .await
            .context("Failed to create output directory")?;

        match process(unit, out_dir).await {
            Ok(files) => outputs.extend(files),
            Err(err) if single => return err.into_outcome(),
            Err(err) => {
                tracing::warn!(
                    capability = %job.capability,
                    item = %label,
                    error = %err,
                    "Skipping item that failed to process"
                );
                skipped.push(format!("{}: {}", label, err));
            }
        }
    }

    if outputs.is_empty() {
        return Ok(ProcessingFailure::invalid_input("None of the uploaded files could be processed")
            .with_detail(skipped.join("; "))
            .into());
    }

    package_outputs(outputs, archive_name).await
}

/// Every regular file a tool left in `dir`, in name order. Names are
/// sanitized, renaming the file on disk when needed.
pub async fn outputs_in_dir(dir: &Path) -> Result<Vec<OutputFile>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    let mut outputs = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let raw_name = entry.file_name().to_string_lossy().into_owned();
        if raw_name.ends_with(".part") || raw_name.ends_with(".ytdl") {
            continue;
        }
        let sanitized = sanitize(&raw_name);
        let mut path = entry.path();
        if sanitized.safe_name != raw_name {
            let renamed = dir.join(&sanitized.safe_name);
            tokio::fs::rename(&path, &renamed)
                .await
                .with_context(|| format!("Failed to rename {}", raw_name))?;
            path = renamed;
        }
        outputs.push(OutputFile {
            path,
            mime_type: mime_for_extension(&sanitized.extension).to_string(),
            file_name: sanitized.safe_name,
        });
    }

    outputs.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(outputs)
}

/// Runs `tool` on one item. A non-zero exit rejects the item with `reason`;
/// a tool that cannot be started fails it.
pub async fn run_tool_on_item<I, S>(
    tool: &ExternalTool,
    args: I,
    reason: impl FnOnce() -> String,
) -> std::result::Result<Vec<u8>, ItemError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = tool.run_unchecked(args).await?;
    if output.status.success() {
        return Ok(output.stdout);
    }
    tracing::warn!(
        tool = tool.label(),
        status = %output.status,
        stderr = %stderr_tail(&output.stderr),
        "External tool rejected its input"
    );
    Err(ItemError::Rejected(reason()))
}

/// One output becomes the artifact itself; several are zipped together.
pub async fn package_outputs(outputs: Vec<OutputFile>, archive_name: &str) -> Result<ProcessingOutcome> {
    match outputs.len() {
        0 => Ok(no_processable_files()),
        1 => {
            let output = outputs.into_iter().next().context("Missing output file")?;
            let data = tokio::fs::read(&output.path)
                .await
                .with_context(|| format!("Failed to read output {}", output.file_name))?;
            Ok(Artifact::new(data, output.file_name, output.mime_type).into())
        }
        _ => {
            let data = tokio::task::spawn_blocking(move || zip_outputs(&outputs))
                .await
                .context("Archive task failed")??;
            Ok(Artifact::new(data, archive_name.to_string(), "application/zip").into())
        }
    }
}

/// `<first input stem>_<suffix>.zip`, or `<suffix>.zip` without inputs.
pub fn archive_name(job: &HandlerJob, suffix: &str) -> String {
    match job.inputs.first() {
        Some(first) => format!("{}_{}.zip", first.stem(), suffix),
        None => format!("{}.zip", suffix),
    }
}

pub fn no_processable_files() -> ProcessingOutcome {
    ProcessingFailure::unsupported_type("No supported files found in the upload").into()
}

fn zip_outputs(outputs: &[OutputFile]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut zip = ZipWriter::new(std::io::Cursor::new(&mut buffer));
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);
        let mut seen = HashSet::new();

        for output in outputs {
            let mut entry_name = output.file_name.clone();
            let mut n = 1;
            while !seen.insert(entry_name.clone()) {
                entry_name = format!("{}-{}", n, output.file_name);
                n += 1;
            }
            let data = std::fs::read(&output.path)
                .with_context(|| format!("Failed to read output {}", output.file_name))?;
            zip.start_file(entry_name.as_str(), options)
                .with_context(|| format!("Failed to add file to ZIP: {}", entry_name))?;
            zip.write_all(&data)
                .with_context(|| format!("Failed to write file data to ZIP: {}", entry_name))?;
        }

        zip.finish().context("Failed to finalize ZIP archive")?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filegate_core::{FailureKind, Options};
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn job_with(dir: &TempDir, inputs: Vec<StagedFile>) -> HandlerJob {
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        HandlerJob {
            capability: "test".to_string(),
            inputs,
            options: Options::default(),
            work_dir,
        }
    }

    fn staged(dir: &TempDir, name: &str, ext: &str, data: &[u8]) -> StagedFile {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        StagedFile {
            field: "file".to_string(),
            path,
            file_name: name.to_string(),
            extension: ext.to_string(),
            size: data.len() as u64,
        }
    }

    #[tokio::test]
    async fn archive_members_are_filtered_and_flattened() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("photos.zip");
        write_zip(
            &archive,
            &[
                ("a.png", b"png"),
                ("nested/deeper/b.JPG", b"jpg"),
                ("../../evil.png", b"evil"),
                ("notes.txt", b"txt"),
            ],
        );
        let input = StagedFile {
            field: "file".to_string(),
            path: archive,
            file_name: "photos.zip".to_string(),
            extension: "zip".to_string(),
            size: 0,
        };
        let job = job_with(&dir, vec![input]);

        let items = collect_items(&job, None, &["png", "jpg"]).await.unwrap();
        let names: Vec<&str> = items.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.JPG"]);
        for item in &items {
            assert!(item.path.starts_with(&job.work_dir));
        }
        assert_eq!(items[1].stem, "b");
        assert_eq!(items[1].extension, "jpg");
    }

    #[test]
    fn member_reads_share_one_budget() {
        let mut budget = 10;
        let first = read_member_bounded(&mut &b"123456"[..], "a.xml", &mut budget).unwrap();
        assert_eq!(first, b"123456");
        assert_eq!(budget, 4);

        match read_member_bounded(&mut &b"12345"[..], "b.xml", &mut budget) {
            Err(ItemError::Rejected(msg)) => assert_eq!(msg, "b.xml expands beyond the allowed size"),
            other => panic!("Expected rejection, got {:?}", other.map(|v| v.len())),
        }

        let mut exact = 4;
        assert_eq!(read_member_bounded(&mut &b"1234"[..], "c.xml", &mut exact).unwrap().len(), 4);
        assert_eq!(exact, 0);
    }

    #[tokio::test]
    async fn plain_inputs_outside_the_list_are_ignored() {
        let dir = TempDir::new().unwrap();
        let inputs = vec![
            staged(&dir, "a.png", "png", b"1"),
            staged(&dir, "b.gif", "gif", b"2"),
        ];
        let job = job_with(&dir, inputs);
        let items = collect_items(&job, Some("file"), &["png"]).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].file_name, "a.png");
    }

    #[tokio::test]
    async fn corrupt_archive_is_an_error() {
        let dir = TempDir::new().unwrap();
        let input = staged(&dir, "broken.zip", "zip", b"not a zip");
        let job = job_with(&dir, vec![input]);
        assert!(collect_items(&job, None, &["png"]).await.is_err());
    }

    #[tokio::test]
    async fn empty_batch_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let job = job_with(&dir, vec![]);
        let outcome = run_batch(&job, vec![], "x", |_item, _dir| async {
            Ok::<_, ItemError>(vec![])
        })
        .await
        .unwrap();
        match outcome {
            ProcessingOutcome::Failure(f) => assert_eq!(f.kind, FailureKind::UnsupportedType),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn single_output_is_returned_directly() {
        let dir = TempDir::new().unwrap();
        let input = staged(&dir, "doc.txt", "txt", b"hello");
        let job = job_with(&dir, vec![input.clone()]);
        let items = vec![BatchItem::from(&input)];

        let outcome = run_batch(&job, items, "copy", |item, out_dir| async move {
            let out = OutputFile::named(&out_dir, &item.stem, "copy", "txt");
            tokio::fs::copy(&item.path, &out.path).await.map_err(anyhow::Error::from)?;
            Ok::<_, ItemError>(vec![out])
        })
        .await
        .unwrap();

        match outcome {
            ProcessingOutcome::Artifact(a) => {
                assert_eq!(a.file_name, "doc_copy.txt");
                assert_eq!(a.mime_type, "text/plain");
                assert_eq!(&a.data[..], b"hello");
            }
            other => panic!("Expected artifact, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn several_outputs_are_zipped_and_failures_skipped() {
        let dir = TempDir::new().unwrap();
        let inputs = vec![
            staged(&dir, "a.txt", "txt", b"a"),
            staged(&dir, "b.txt", "txt", b"b"),
            staged(&dir, "bad.txt", "txt", b"bad"),
        ];
        let job = job_with(&dir, inputs.clone());
        let items = inputs.iter().map(BatchItem::from).collect();

        let outcome = run_batch(&job, items, "copy", |item, out_dir| async move {
            if item.stem == "bad" {
                return Err(ItemError::Rejected("unreadable".to_string()));
            }
            let out = OutputFile::named(&out_dir, &item.stem, "copy", "txt");
            tokio::fs::copy(&item.path, &out.path).await.map_err(anyhow::Error::from)?;
            Ok::<_, ItemError>(vec![out])
        })
        .await
        .unwrap();

        let artifact = match outcome {
            ProcessingOutcome::Artifact(a) => a,
            other => panic!("Expected artifact, got {:?}", other),
        };
        assert_eq!(artifact.file_name, "a_copy.zip");
        assert_eq!(artifact.mime_type, "application/zip");

        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(artifact.data.to_vec())).unwrap();
        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a_copy.txt", "b_copy.txt"]);
    }

    #[tokio::test]
    async fn single_rejected_item_is_invalid_input() {
        let dir = TempDir::new().unwrap();
        let input = staged(&dir, "a.txt", "txt", b"a");
        let job = job_with(&dir, vec![input.clone()]);

        let outcome = run_batch(&job, vec![BatchItem::from(&input)], "x", |_item, _dir| async {
            Err::<Vec<OutputFile>, _>(ItemError::Rejected("bad password".to_string()))
        })
        .await
        .unwrap();

        match outcome {
            ProcessingOutcome::Failure(f) => {
                assert_eq!(f.kind, FailureKind::InvalidInput);
                assert_eq!(f.message, "bad password");
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn outputs_in_dir_sanitizes_and_skips_partials() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("My Clip (1).mp4"), b"v").unwrap();
        std::fs::write(dir.path().join("other.mp4.part"), b"p").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let outputs = outputs_in_dir(dir.path()).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].file_name, "My_Clip__1_.mp4");
        assert_eq!(outputs[0].mime_type, "video/mp4");
        assert!(outputs[0].path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_exit_failure_rejects_the_item() {
        let tool = ExternalTool::new("sh", "sh");
        let err = run_tool_on_item(&tool, ["-c", "exit 1"], || "no audio".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::Rejected(ref msg) if msg == "no audio"));

        let missing = ExternalTool::new("ghost", "definitely-not-a-real-binary-filegate");
        let err = run_tool_on_item(&missing, ["x"], || unreachable!()).await.unwrap_err();
        assert!(matches!(err, ItemError::Failed(_)));
    }
}
