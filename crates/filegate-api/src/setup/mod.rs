//! Application setup and initialization
//!
//! Everything between a loaded [`Config`] and a router ready to serve.

pub mod routes;
pub mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use filegate_core::Config;
use filegate_infra::{StagingArea, StagingSweeper};
use filegate_processing::{default_registry, CapabilityRegistry};
use tokio::task::JoinHandle;

use crate::state::AppState;

/// A built application: shared state, the router, and the background sweep
/// task if one was started.
pub struct App {
    pub state: Arc<AppState>,
    pub router: axum::Router,
    pub sweeper: Option<JoinHandle<()>>,
}

/// Initialize the entire application with the built-in capability catalog.
pub async fn initialize_app(config: Config) -> Result<App> {
    // Validate configuration first - fail fast on misconfiguration
    config.validate().context("Configuration validation failed")?;

    crate::telemetry::init_telemetry(config.is_production());
    tracing::info!(environment = %config.environment(), "Configuration loaded and validated successfully");

    let registry =
        default_registry(config.tools()).context("Failed to build the capability registry")?;
    let state = build_state(config, registry).await?;
    let router = routes::setup_routes(state.clone());
    let sweeper = start_sweeper(&state);

    Ok(App {
        state,
        router,
        sweeper,
    })
}

/// Prepares the staging root, clears what a previous run left behind and
/// builds the state. Tests call this with their own registry.
pub async fn build_state(config: Config, registry: CapabilityRegistry) -> Result<Arc<AppState>> {
    let staging = Arc::new(StagingArea::from_config(config.staging()));
    staging.ensure_root().await.with_context(|| {
        format!(
            "Staging root {} is not usable",
            staging.root().display()
        )
    })?;

    let report = StagingSweeper::sweep_once(&staging).await;
    tracing::info!(
        root = %staging.root().display(),
        removed = report.removed,
        failed = report.failed,
        "Startup staging sweep finished"
    );

    Ok(Arc::new(AppState::new(config, registry, staging)))
}

/// Starts the periodic sweep unless it is disabled.
pub fn start_sweeper(state: &AppState) -> Option<JoinHandle<()>> {
    let every = state.config.staging().sweep_interval?;
    tracing::info!(interval_secs = every.as_secs(), "Periodic staging sweep enabled");
    Some(StagingSweeper::new(state.staging.clone(), every).spawn())
}
