//! Request-scoped staging directories
//!
//! Every request gets its own directory under the staging root. Its inputs are
//! written into `input/`, handlers scribble in `work/`, and the whole tree is
//! removed when the scope is released or dropped. The sweep never removes a
//! directory whose scope is still alive.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use filegate_core::sanitize::MAX_FILENAME_LENGTH;
use filegate_core::{StagedFile, StagingConfig};
use uuid::Uuid;

/// Prefix of every directory this process family creates. The sweep never
/// touches anything else under the root.
pub const STAGING_DIR_PREFIX: &str = "fg-";
const INPUT_DIR: &str = "input";
const WORK_DIR: &str = "work";
/// Attempts at finding a free name for a duplicate upload name.
pub const MAX_NAME_ATTEMPTS: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Failed to create staging directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write staged file {name}: {source}")]
    Write {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Staging directory {0} has already been released")]
    Released(PathBuf),

    #[error("No free name for staged file {0}")]
    NameExhausted(String),
}

/// Directories of scopes that have not been released yet.
type LiveScopes = Arc<Mutex<HashSet<PathBuf>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The staging root. Cheap to share: a counter keeps directory names unique
/// within the process and the live set shields in-flight scopes from the
/// sweep.
#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
    max_age: Duration,
    counter: AtomicU64,
    live: LiveScopes,
}

/// What a sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
    pub kept: usize,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            root: root.into(),
            max_age,
            counter: AtomicU64::new(0),
            live: LiveScopes::default(),
        }
    }

    pub fn from_config(config: &StagingConfig) -> Self {
        Self::new(config.root.clone(), config.max_age)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Number of scopes acquired and not yet released.
    pub fn live_scopes(&self) -> usize {
        lock(&self.live).len()
    }

    /// Creates the root if it is missing.
    pub async fn ensure_root(&self) -> Result<(), StagingError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StagingError::Create {
                path: self.root.clone(),
                source,
            })
    }

    /// A fresh, uniquely named directory: process id, a per-process counter
    /// and a random token.
    pub async fn acquire(&self) -> Result<ScopedStagingDir, StagingError> {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let token = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}{}-{}-{}",
            STAGING_DIR_PREFIX,
            std::process::id(),
            seq,
            &token[..12]
        );
        let path = self.root.join(name);

        // `create_dir` (not `_all`) on the leaf: an existing directory is a
        // collision, never something to reuse.
        self.ensure_root().await?;
        tokio::fs::create_dir(&path)
            .await
            .map_err(|source| StagingError::Create {
                path: path.clone(),
                source,
            })?;
        let scope = ScopedStagingDir::new(path, self.live.clone());
        for sub in [INPUT_DIR, WORK_DIR] {
            let dir = scope.path.join(sub);
            tokio::fs::create_dir(&dir)
                .await
                .map_err(|source| StagingError::Create { path: dir, source })?;
        }

        tracing::debug!(path = %scope.path.display(), "Acquired staging directory");
        Ok(scope)
    }

    /// Removes staging directories older than `max_age`. Only directories
    /// with the staging prefix are considered, and live scopes are skipped
    /// whatever their age.
    pub async fn sweep_stale(&self) -> SweepReport {
        let root = self.root.clone();
        let max_age = self.max_age;
        let live = self.live.clone();
        match tokio::task::spawn_blocking(move || {
            let in_flight = lock(&live).clone();
            sweep_dir(&root, max_age, SystemTime::now(), &in_flight)
        })
        .await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Staging sweep task failed");
                SweepReport::default()
            }
        }
    }

    /// Checks that the root accepts writes, for health reporting.
    pub async fn probe(&self) -> Result<(), StagingError> {
        self.ensure_root().await?;
        let probe = self
            .root
            .join(format!(".probe-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&probe, b"ok")
            .await
            .map_err(|source| StagingError::Write {
                name: probe.display().to_string(),
                source,
            })?;
        if let Err(e) = tokio::fs::remove_file(&probe).await {
            tracing::warn!(path = %probe.display(), error = %e, "Failed to remove health probe");
        }
        Ok(())
    }
}

fn sweep_dir(
    root: &Path,
    max_age: Duration,
    now: SystemTime,
    in_flight: &HashSet<PathBuf>,
) -> SweepReport {
    let mut report = SweepReport::default();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "Cannot read staging root");
            return report;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(STAGING_DIR_PREFIX) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        if in_flight.contains(&entry.path()) {
            report.kept += 1;
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            report.kept += 1;
            continue;
        }

        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => report.removed += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove stale staging directory");
            }
        }
    }
    report
}

/// One request's staging directory. Released exactly once: explicitly through
/// [`ScopedStagingDir::release`], or on drop.
#[derive(Debug)]
pub struct ScopedStagingDir {
    path: PathBuf,
    released: bool,
    live: LiveScopes,
    /// Input names handed out so far.
    names: Mutex<HashSet<String>>,
}

impl ScopedStagingDir {
    fn new(path: PathBuf, live: LiveScopes) -> Self {
        lock(&live).insert(path.clone());
        Self {
            path,
            released: false,
            live,
            names: Mutex::new(HashSet::new()),
        }
    }

    fn forget(&self) {
        lock(&self.live).remove(&self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scratch space for the handler.
    pub fn work_dir(&self) -> PathBuf {
        self.path.join(WORK_DIR)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Writes one upload. The bytes go to a hidden temporary name first and
    /// are renamed into place, so a failed write never leaves a file under
    /// the final name. Duplicate names get a numeric suffix.
    pub async fn write_input(
        &self,
        field: &str,
        safe_name: &str,
        extension: &str,
        data: &[u8],
    ) -> Result<StagedFile, StagingError> {
        if self.released {
            return Err(StagingError::Released(self.path.clone()));
        }
        let dir = self.path.join(INPUT_DIR);
        let file_name = {
            let mut names = lock(&self.names);
            let name = free_name(&names, safe_name, extension)?;
            names.insert(name.clone());
            name
        };
        let final_path = dir.join(&file_name);
        let temp_path = dir.join(format!(".{}.part", Uuid::new_v4().simple()));

        let write_err = |source| StagingError::Write {
            name: file_name.clone(),
            source,
        };
        let written = match tokio::fs::write(&temp_path, data).await {
            Ok(()) => tokio::fs::rename(&temp_path, &final_path).await,
            Err(e) => Err(e),
        };
        if let Err(source) = written {
            let _ = tokio::fs::remove_file(&temp_path).await;
            lock(&self.names).remove(&file_name);
            return Err(write_err(source));
        }

        Ok(StagedFile {
            field: field.to_string(),
            path: final_path,
            file_name,
            extension: extension.to_string(),
            size: data.len() as u64,
        })
    }

    /// Recursively deletes the directory. Idempotent; failures are logged.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || remove_tree(&path)).await;
        if let Err(e) = result {
            tracing::error!(path = %self.path.display(), error = %e, "Staging release task failed");
        }
        self.forget();
    }
}

impl Drop for ScopedStagingDir {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            remove_tree(&self.path);
        }
        self.forget();
    }
}

fn remove_tree(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Released staging directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging directory")
        }
    }
}

/// `name`, or `stem_N.ext` for the first N not in `taken`. The stem is
/// shortened when the suffix would push the name past the filesystem limit.
fn free_name(taken: &HashSet<String>, name: &str, extension: &str) -> Result<String, StagingError> {
    if !taken.contains(name) {
        return Ok(name.to_string());
    }
    let (stem, dot_ext) = match name.len().checked_sub(extension.len() + 1) {
        Some(cut) if !extension.is_empty() && name.is_char_boundary(cut) => name.split_at(cut),
        _ => (name, ""),
    };
    for n in 1..MAX_NAME_ATTEMPTS {
        let suffix = format!("_{}{}", n, dot_ext);
        let mut keep = stem.len().min(MAX_FILENAME_LENGTH.saturating_sub(suffix.len()));
        while !stem.is_char_boundary(keep) {
            keep -= 1;
        }
        let candidate = format!("{}{}", &stem[..keep], suffix);
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(StagingError::NameExhausted(name.to_string()))
}
