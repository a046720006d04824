//! Capability index served at `/`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use filegate_processing::{CapabilityDescriptor, CapabilityRegistry};
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct CapabilityInfo {
    pub key: String,
    pub route: String,
    pub extensions: Vec<String>,
    /// Option names with their defaults; `null` means no default
    #[schema(value_type = Object)]
    pub options: serde_json::Value,
}

impl From<&CapabilityDescriptor> for CapabilityInfo {
    fn from(descriptor: &CapabilityDescriptor) -> Self {
        Self {
            key: descriptor.key.clone(),
            route: descriptor.route(),
            extensions: descriptor.accepted_extensions.iter().cloned().collect(),
            options: serde_json::to_value(&descriptor.options).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IndexResponse {
    pub status: String,
    pub message: String,
    pub version: String,
    /// Capabilities keyed by group, in registration order within a group
    pub capabilities: BTreeMap<String, Vec<CapabilityInfo>>,
}

pub fn group_capabilities(registry: &CapabilityRegistry) -> BTreeMap<String, Vec<CapabilityInfo>> {
    let mut groups: BTreeMap<String, Vec<CapabilityInfo>> = BTreeMap::new();
    for descriptor in registry.list() {
        groups
            .entry(descriptor.group.as_str().to_string())
            .or_default()
            .push(CapabilityInfo::from(descriptor.as_ref()));
    }
    groups
}

#[utoipa::path(
    get,
    path = "/",
    tag = "service",
    responses(
        (status = 200, description = "Available capabilities", body = IndexResponse)
    )
)]
pub async fn index(State(state): State<Arc<AppState>>) -> Json<IndexResponse> {
    Json(IndexResponse {
        status: "ok".to_string(),
        message: "Filegate file processing gateway".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: group_capabilities(&state.registry),
    })
}
