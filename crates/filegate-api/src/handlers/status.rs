//! Service status: configuration and external tool availability. Never
//! touches the dispatcher or staging.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use filegate_processing::ExternalTool;
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct ToolStatus {
    /// Configured program name or path
    pub program: String,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub service: String,
    pub version: String,
    pub environment: String,
    pub uptime_secs: i64,
    pub capabilities: usize,
    pub max_upload_size_bytes: usize,
    pub tools: BTreeMap<String, ToolStatus>,
}

#[utoipa::path(
    get,
    path = "/status",
    tag = "service",
    responses(
        (status = 200, description = "Service status", body = StatusResponse)
    )
)]
pub async fn service_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let tools = state
        .config
        .tools()
        .entries()
        .into_iter()
        .map(|(name, program)| {
            let resolved = ExternalTool::new(name, program).locate();
            (
                name.to_string(),
                ToolStatus {
                    program: program.to_string(),
                    found: resolved.is_some(),
                    resolved_path: resolved.map(|p| p.display().to_string()),
                },
            )
        })
        .collect();

    Json(StatusResponse {
        service: "filegate".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.config.environment().to_string(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        capabilities: state.registry.len(),
        max_upload_size_bytes: state.config.max_upload_size_bytes(),
        tools,
    })
}
