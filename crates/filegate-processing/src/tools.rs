//! External tool execution (ffmpeg, qpdf, LibreOffice, Ghostscript, yt-dlp, rembg).
//!
//! Every child is spawned with `kill_on_drop`, so aborting a handler task on
//! timeout also kills the process it is waiting on.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;

/// Tail of stderr kept in error messages.
const STDERR_TAIL_BYTES: usize = 2000;

#[derive(Debug, Clone)]
pub struct ExternalTool {
    label: &'static str,
    program: String,
}

impl ExternalTool {
    pub fn new(label: &'static str, program: impl Into<String>) -> Self {
        Self {
            label,
            program: program.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs the tool and fails unless it exits successfully. Returns stdout.
    pub async fn run<I, S>(&self, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run_unchecked(args).await?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} failed ({}): {}",
                self.label,
                output.status,
                stderr_tail(&output.stderr)
            ));
        }
        Ok(output.stdout)
    }

    /// Runs the tool and returns its raw output, whatever the exit status.
    pub async fn run_unchecked<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        tracing::debug!(tool = self.label, program = %self.program, "Running external tool");
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.label))
    }

    /// Resolved location of the binary, if it can be found.
    pub fn locate(&self) -> Option<PathBuf> {
        locate(&self.program)
    }
}

/// Looks a program up the way a shell would: paths are checked directly, bare
/// names are searched on `PATH`.
pub fn locate(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

pub fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}
