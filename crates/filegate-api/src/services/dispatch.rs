//! Request dispatcher
//!
//! The one path every capability request takes: resolve the capability,
//! validate the uploads, stage them, run the handler under a timeout, release
//! the staging directory, and hand back a [`ProcessingOutcome`]. Nothing a
//! handler does (error, panic, hang) escapes as anything but a `Failure`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use filegate_core::error::detailed_message;
use filegate_core::sanitize::{sanitize, SanitizedFilename};
use filegate_core::{
    FailureKind, InputPolicy, ProcessingFailure, ProcessingOutcome, RawOptions, UploadedArtifact,
};
use filegate_infra::{ScopedStagingDir, StagingArea};
use filegate_processing::{CapabilityDescriptor, CapabilityRegistry, HandlerJob};
use tokio::task::JoinError;
use tokio_util::task::AbortOnDropHandle;

#[derive(Debug, Clone, Copy)]
pub struct DispatchLimits {
    pub max_upload_bytes: usize,
    pub handler_timeout: Duration,
    /// How long release may take after the handler is gone.
    pub cleanup_grace: Duration,
}

pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    staging: Arc<StagingArea>,
    limits: DispatchLimits,
}

impl Dispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, staging: Arc<StagingArea>, limits: DispatchLimits) -> Self {
        Self {
            registry,
            staging,
            limits,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn limits(&self) -> DispatchLimits {
        self.limits
    }

    #[tracing::instrument(skip_all, fields(capability = %key, uploads = uploads.len()))]
    pub async fn dispatch(
        &self,
        key: &str,
        uploads: Vec<UploadedArtifact>,
        raw_options: RawOptions,
    ) -> ProcessingOutcome {
        let started = Instant::now();

        let Ok(descriptor) = self.registry.resolve(key) else {
            return ProcessingFailure::not_found(format!("Unknown capability '{}'", key)).into();
        };
        let names = match self.validate(&descriptor, &uploads) {
            Ok(names) => names,
            Err(failure) => return failure.into(),
        };

        let mut scope = match self.staging.acquire().await {
            Ok(scope) => scope,
            Err(e) => {
                tracing::error!(error = %e, "Failed to acquire staging directory");
                return ProcessingFailure::staging("Could not prepare a working area for the upload")
                    .with_detail(e.to_string())
                    .into();
            }
        };

        let outcome = self
            .run_in_scope(&scope, &descriptor, uploads, names, raw_options)
            .await;

        if tokio::time::timeout(self.limits.cleanup_grace, scope.release())
            .await
            .is_err()
        {
            tracing::warn!(
                path = %scope.path().display(),
                grace_ms = self.limits.cleanup_grace.as_millis() as u64,
                "Staging release did not finish within the grace period"
            );
        }

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = outcome_label(&outcome),
            "Dispatch finished"
        );
        outcome
    }

    /// Checks everything that can be checked before touching the disk.
    fn validate(
        &self,
        descriptor: &CapabilityDescriptor,
        uploads: &[UploadedArtifact],
    ) -> Result<Vec<SanitizedFilename>, ProcessingFailure> {
        let names: Vec<SanitizedFilename> = uploads.iter().map(|u| sanitize(&u.file_name)).collect();

        if let Some(rejected) = names
            .iter()
            .find(|n| !descriptor.is_accepted_extension(&n.extension))
        {
            let shown = if rejected.extension.is_empty() {
                "(none)".to_string()
            } else {
                format!(".{}", rejected.extension)
            };
            let accepted: Vec<&str> = descriptor
                .accepted_extensions
                .iter()
                .map(String::as_str)
                .collect();
            return Err(ProcessingFailure::unsupported_type(format!(
                "Unsupported file type {} for {}. Accepted: {}",
                shown,
                descriptor.key,
                accepted.join(", ")
            )));
        }

        if uploads.is_empty() && descriptor.input == InputPolicy::Required {
            return Err(ProcessingFailure::unsupported_type("No file uploaded"));
        }

        let total: usize = uploads.iter().map(UploadedArtifact::len).sum();
        if total > self.limits.max_upload_bytes {
            return Err(ProcessingFailure::payload_too_large(format!(
                "Upload exceeds the maximum size of {} MB",
                self.limits.max_upload_bytes / 1024 / 1024
            )));
        }

        Ok(names)
    }

    async fn run_in_scope(
        &self,
        scope: &ScopedStagingDir,
        descriptor: &CapabilityDescriptor,
        uploads: Vec<UploadedArtifact>,
        names: Vec<SanitizedFilename>,
        raw_options: RawOptions,
    ) -> ProcessingOutcome {
        let mut inputs = Vec::with_capacity(uploads.len());
        for (upload, name) in uploads.iter().zip(&names) {
            match scope
                .write_input(&upload.field, &name.safe_name, &name.extension, &upload.data)
                .await
            {
                Ok(staged) => inputs.push(staged),
                Err(e) => {
                    tracing::error!(error = %e, file = %name.safe_name, "Failed to stage upload");
                    return ProcessingFailure::staging("Could not store the uploaded file")
                        .with_detail(e.to_string())
                        .into();
                }
            }
        }
        drop(uploads);

        let job = HandlerJob {
            capability: descriptor.key.clone(),
            inputs,
            options: descriptor.options.merge(&raw_options),
            work_dir: scope.work_dir(),
        };
        let handler = descriptor.handler.clone();
        let mut task = AbortOnDropHandle::new(tokio::spawn(async move { handler.process(job).await }));

        match tokio::time::timeout(self.limits.handler_timeout, &mut task).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(err))) => {
                tracing::error!(error = %detailed_message(&err), "Handler returned an error");
                ProcessingFailure::handler_crashed(&err).into()
            }
            Ok(Err(join_err)) => crashed_task(join_err).into(),
            Err(_) => {
                task.abort();
                // Wait for the abort to land so child processes are gone
                // before the directory is removed.
                if tokio::time::timeout(self.limits.cleanup_grace, &mut task)
                    .await
                    .is_err()
                {
                    tracing::warn!("Timed out handler did not stop within the grace period");
                }
                tracing::warn!(
                    timeout_secs = self.limits.handler_timeout.as_secs(),
                    "Handler timed out"
                );
                ProcessingFailure::timeout(format!(
                    "Processing did not finish within {} seconds",
                    self.limits.handler_timeout.as_secs()
                ))
                .into()
            }
        }
    }
}

fn crashed_task(err: JoinError) -> ProcessingFailure {
    let detail = if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("Handler panicked: {}", message)
    } else {
        "Handler task was cancelled".to_string()
    };
    tracing::error!(detail = %detail, "Handler crashed");
    ProcessingFailure::new(FailureKind::HandlerCrashed, "Processing failed").with_detail(detail)
}

fn outcome_label(outcome: &ProcessingOutcome) -> &'static str {
    match outcome {
        ProcessingOutcome::Artifact(_) => "artifact",
        ProcessingOutcome::StatusPayload(_) => "status",
        ProcessingOutcome::Failure(f) => f.kind.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use filegate_core::{Artifact, CapabilityGroup, OptionSchema};
    use filegate_processing::CapabilityHandler;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Lists what it was given: its input directory and its options.
    struct EchoHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CapabilityHandler for EchoHandler {
        async fn process(&self, job: HandlerJob) -> anyhow::Result<ProcessingOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut seen = Vec::new();
            if let Some(first) = job.inputs.first() {
                let dir = first.path.parent().unwrap();
                for entry in std::fs::read_dir(dir)? {
                    seen.push(entry?.file_name().to_string_lossy().into_owned());
                }
            }
            seen.sort();
            let contents: Vec<String> = job
                .inputs
                .iter()
                .map(|f| String::from_utf8_lossy(&std::fs::read(&f.path).unwrap()).into_owned())
                .collect();
            Ok(ProcessingOutcome::StatusPayload(serde_json::json!({
                "files": seen,
                "contents": contents,
                "options": job.options,
            })))
        }
    }

    struct SleepHandler;

    #[async_trait]
    impl CapabilityHandler for SleepHandler {
        async fn process(&self, _job: HandlerJob) -> anyhow::Result<ProcessingOutcome> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Artifact::new(Vec::new(), "never", "text/plain").into())
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl CapabilityHandler for PanicHandler {
        async fn process(&self, _job: HandlerJob) -> anyhow::Result<ProcessingOutcome> {
            panic!("decoder exploded");
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl CapabilityHandler for FailingHandler {
        async fn process(&self, job: HandlerJob) -> anyhow::Result<ProcessingOutcome> {
            std::fs::write(job.work_dir.join("partial.out"), b"half")?;
            Err(anyhow::anyhow!("tool exited with status 1"))
        }
    }

    struct Fixture {
        dir: TempDir,
        dispatcher: Dispatcher,
        calls: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn root(&self) -> &Path {
            self.dir.path()
        }

        /// Staging directories still on disk.
        fn leftovers(&self) -> usize {
            match std::fs::read_dir(self.root().join("staging")) {
                Ok(entries) => entries.count(),
                Err(_) => 0,
            }
        }
    }

    fn fixture(timeout: Duration) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = CapabilityRegistry::new();
        let echo = Arc::new(EchoHandler {
            calls: calls.clone(),
        });
        registry
            .register(
                CapabilityDescriptor::new("echo", CapabilityGroup::Conversion, echo.clone())
                    .accepts(["txt", "pdf"])
                    .options(OptionSchema::new().with("quality", 85)),
            )
            .unwrap();
        registry
            .register(
                CapabilityDescriptor::new("echo-optional", CapabilityGroup::Video, echo)
                    .accepts(["txt"])
                    .input(InputPolicy::Optional),
            )
            .unwrap();
        for (key, handler) in [
            ("sleep", Arc::new(SleepHandler) as Arc<dyn CapabilityHandler>),
            ("panic", Arc::new(PanicHandler) as Arc<dyn CapabilityHandler>),
            ("fail", Arc::new(FailingHandler) as Arc<dyn CapabilityHandler>),
        ] {
            registry
                .register(CapabilityDescriptor::new(key, CapabilityGroup::Pdf, handler).accepts(["txt"]))
                .unwrap();
        }

        let dir = TempDir::new().unwrap();
        let staging = Arc::new(StagingArea::new(
            dir.path().join("staging"),
            Duration::from_secs(3600),
        ));
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            staging,
            DispatchLimits {
                max_upload_bytes: 1024,
                handler_timeout: timeout,
                cleanup_grace: Duration::from_secs(5),
            },
        );
        Fixture {
            dir,
            dispatcher,
            calls,
        }
    }

    fn upload(name: &str, data: &str) -> UploadedArtifact {
        UploadedArtifact::new("file", name, data.as_bytes().to_vec())
    }

    fn failure(outcome: ProcessingOutcome) -> ProcessingFailure {
        match outcome {
            ProcessingOutcome::Failure(f) => f,
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    fn payload(outcome: ProcessingOutcome) -> serde_json::Value {
        match outcome {
            ProcessingOutcome::StatusPayload(v) => v,
            other => panic!("Expected payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_capability_writes_nothing() {
        let f = fixture(Duration::from_secs(5));
        let outcome = f
            .dispatcher
            .dispatch("nope", vec![upload("a.txt", "x")], RawOptions::new())
            .await;
        assert_eq!(failure(outcome).kind, FailureKind::NotFound);
        assert!(!f.root().join("staging").exists());
    }

    #[tokio::test]
    async fn unsupported_extension_skips_handler() {
        let f = fixture(Duration::from_secs(5));
        let outcome = f
            .dispatcher
            .dispatch("echo", vec![upload("a.txt", "x"), upload("evil.exe", "x")], RawOptions::new())
            .await;
        let failure = failure(outcome);
        assert_eq!(failure.kind, FailureKind::UnsupportedType);
        assert!(failure.message.contains(".exe"));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert!(!f.root().join("staging").exists());
    }

    #[tokio::test]
    async fn empty_upload_depends_on_input_policy() {
        let f = fixture(Duration::from_secs(5));
        let outcome = f.dispatcher.dispatch("echo", vec![], RawOptions::new()).await;
        assert_eq!(failure(outcome).kind, FailureKind::UnsupportedType);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);

        let outcome = f
            .dispatcher
            .dispatch("echo-optional", vec![], RawOptions::new())
            .await;
        payload(outcome);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.leftovers(), 0);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let f = fixture(Duration::from_secs(5));
        let big = "x".repeat(1025);
        let outcome = f
            .dispatcher
            .dispatch("echo", vec![upload("a.txt", &big)], RawOptions::new())
            .await;
        assert_eq!(failure(outcome).kind, FailureKind::PayloadTooLarge);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_merges_options_and_cleans_up() {
        let f = fixture(Duration::from_secs(5));
        let mut raw = RawOptions::new();
        raw.insert("quality".to_string(), "50".to_string());
        raw.insert("unknown".to_string(), "1".to_string());

        let outcome = f
            .dispatcher
            .dispatch("echo", vec![upload("../../etc/notes.TXT", "hello")], raw)
            .await;
        let body = payload(outcome);
        assert_eq!(body["files"], serde_json::json!(["notes.TXT"]));
        assert_eq!(body["contents"], serde_json::json!(["hello"]));
        assert_eq!(body["options"], serde_json::json!({"quality": "50"}));
        assert_eq!(f.leftovers(), 0);
    }

    #[tokio::test]
    async fn handler_error_is_a_crash_and_cleans_up() {
        let f = fixture(Duration::from_secs(5));
        let outcome = f
            .dispatcher
            .dispatch("fail", vec![upload("a.txt", "x")], RawOptions::new())
            .await;
        let failure = failure(outcome);
        assert_eq!(failure.kind, FailureKind::HandlerCrashed);
        assert_eq!(failure.message, "Processing failed");
        assert!(failure.detail.unwrap().contains("status 1"));
        assert_eq!(f.leftovers(), 0);
    }

    #[tokio::test]
    async fn handler_panic_is_a_crash_and_cleans_up() {
        let f = fixture(Duration::from_secs(5));
        let outcome = f
            .dispatcher
            .dispatch("panic", vec![upload("a.txt", "x")], RawOptions::new())
            .await;
        let failure = failure(outcome);
        assert_eq!(failure.kind, FailureKind::HandlerCrashed);
        assert!(failure.detail.unwrap().contains("decoder exploded"));
        assert_eq!(f.leftovers(), 0);
    }

    #[tokio::test]
    async fn hung_handler_times_out_and_cleans_up() {
        let f = fixture(Duration::from_millis(100));
        let started = Instant::now();
        let outcome = f
            .dispatcher
            .dispatch("sleep", vec![upload("a.txt", "x")], RawOptions::new())
            .await;
        assert_eq!(failure(outcome).kind, FailureKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(f.leftovers(), 0);
    }

    #[tokio::test]
    async fn staging_failure_is_reported() {
        let f = fixture(Duration::from_secs(5));
        // A file where the staging root should be.
        std::fs::write(f.root().join("staging"), b"not a directory").unwrap();
        let outcome = f
            .dispatcher
            .dispatch("echo", vec![upload("a.txt", "x")], RawOptions::new())
            .await;
        assert_eq!(failure(outcome).kind, FailureKind::StagingError);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_input_write_releases_the_scope() {
        let f = fixture(Duration::from_secs(5));
        // One more copy of the same name than the directory can hold, so the
        // last write fails after the scope and earlier inputs exist.
        let uploads: Vec<_> = (0..=filegate_infra::staging::MAX_NAME_ATTEMPTS)
            .map(|_| upload("a.txt", "x"))
            .collect();
        let outcome = f.dispatcher.dispatch("echo", uploads, RawOptions::new()).await;

        let failure = failure(outcome);
        assert_eq!(failure.kind, FailureKind::StagingError);
        assert!(failure.detail.unwrap().contains("a.txt"));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.leftovers(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatches_are_isolated() {
        let f = Arc::new(fixture(Duration::from_secs(30)));
        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let f = f.clone();
                tokio::spawn(async move {
                    let name = format!("req-{}.txt", i);
                    let outcome = f
                        .dispatcher
                        .dispatch("echo", vec![upload(&name, &i.to_string())], RawOptions::new())
                        .await;
                    (name, i, payload(outcome))
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            let (name, i, body) = result.unwrap();
            assert_eq!(body["files"], serde_json::json!([name]));
            assert_eq!(body["contents"], serde_json::json!([i.to_string()]));
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 50);
        assert_eq!(f.leftovers(), 0);
    }
}
