//! Shared setup for API integration tests: a real router over the built-in
//! catalog plus a few test-only capabilities, staged under a temp directory.

#![allow(dead_code)]

pub mod fixtures;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum_test::TestServer;
use filegate_api::setup;
use filegate_api::state::AppState;
use filegate_core::{
    Artifact, CapabilityGroup, Config, GatewayConfig, InputPolicy, OptionSchema, ProcessingOutcome,
};
use filegate_processing::{
    default_registry, CapabilityDescriptor, CapabilityHandler, CapabilityRegistry, HandlerJob,
};
use tempfile::TempDir;

/// Test application state
pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub _temp_dir: TempDir,
}

impl TestApp {
    /// Get the HTTP test client
    pub fn client(&self) -> &TestServer {
        &self.server
    }

    pub fn staging_root(&self) -> &Path {
        self.state.staging.root()
    }

    /// Number of request directories currently under the staging root.
    pub fn staged_dirs(&self) -> usize {
        std::fs::read_dir(self.staging_root())
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }
}

/// Never finishes on its own.
struct StallHandler;

#[async_trait]
impl CapabilityHandler for StallHandler {
    async fn process(&self, _job: HandlerJob) -> anyhow::Result<ProcessingOutcome> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Artifact::new(Vec::new(), "never.txt", "text/plain").into())
    }
}

struct PanicHandler;

#[async_trait]
impl CapabilityHandler for PanicHandler {
    async fn process(&self, _job: HandlerJob) -> anyhow::Result<ProcessingOutcome> {
        panic!("handler bug");
    }
}

/// Reports the job it received as JSON.
struct InspectHandler;

#[async_trait]
impl CapabilityHandler for InspectHandler {
    async fn process(&self, job: HandlerJob) -> anyhow::Result<ProcessingOutcome> {
        let files: Vec<String> = job.inputs.iter().map(|f| f.file_name.clone()).collect();
        Ok(ProcessingOutcome::StatusPayload(serde_json::json!({
            "capability": job.capability,
            "files": files,
            "options": job.options,
        })))
    }
}

fn test_registry(tools: &filegate_core::ToolPaths) -> CapabilityRegistry {
    let mut registry = default_registry(tools).expect("built-in catalog registers");
    registry
        .register(
            CapabilityDescriptor::new("test-stall", CapabilityGroup::Conversion, Arc::new(StallHandler))
                .accepts(["txt"]),
        )
        .unwrap();
    registry
        .register(
            CapabilityDescriptor::new("test-panic", CapabilityGroup::Conversion, Arc::new(PanicHandler))
                .accepts(["txt"]),
        )
        .unwrap();
    registry
        .register(
            CapabilityDescriptor::new("test-inspect", CapabilityGroup::Conversion, Arc::new(InspectHandler))
                .accepts(["txt", "csv"])
                .options(OptionSchema::new().with("mode", "fast"))
                .input(InputPolicy::Optional),
        )
        .unwrap();
    registry
}

/// Setup a test application in development mode.
pub async fn setup_test_app() -> TestApp {
    setup_test_app_with(&[]).await
}

/// Setup a test application with extra environment entries layered over the
/// test defaults.
pub async fn setup_test_app_with(overrides: &[(&str, &str)]) -> TestApp {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let staging_root = temp_dir.path().join("staging");

    let mut vars: HashMap<String, String> = HashMap::from([
        ("ENVIRONMENT".to_string(), "development".to_string()),
        ("CORS_ORIGINS".to_string(), "*".to_string()),
        ("MAX_UPLOAD_SIZE_BYTES".to_string(), (8 * 1024 * 1024).to_string()),
        ("HANDLER_TIMEOUT_SECS".to_string(), "1".to_string()),
        ("CLEANUP_GRACE_SECS".to_string(), "2".to_string()),
        ("STAGING_SWEEP_INTERVAL_SECS".to_string(), "0".to_string()),
        (
            "STAGING_ROOT".to_string(),
            staging_root.to_string_lossy().into_owned(),
        ),
    ]);
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }

    let config = Config(Box::new(
        GatewayConfig::from_lookup(|key| vars.get(key).cloned()).expect("Invalid test config"),
    ));
    config.validate().expect("Test config must validate");

    let registry = test_registry(config.tools());
    let state = setup::build_state(config, registry)
        .await
        .expect("Failed to build app state");
    let router = setup::routes::setup_routes(state.clone());
    let server = TestServer::new(router).expect("Failed to create test server");

    TestApp {
        server,
        state,
        _temp_dir: temp_dir,
    }
}
