//! Application state shared by every handler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use filegate_core::Config;
use filegate_infra::StagingArea;
use filegate_processing::CapabilityRegistry;

use crate::services::{DispatchLimits, Dispatcher};

pub struct AppState {
    pub config: Config,
    pub registry: Arc<CapabilityRegistry>,
    pub staging: Arc<StagingArea>,
    pub dispatcher: Dispatcher,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wires the dispatcher to `registry` and `staging` using the limits in
    /// `config`.
    pub fn new(config: Config, registry: CapabilityRegistry, staging: Arc<StagingArea>) -> Self {
        let registry = Arc::new(registry);
        let dispatcher = Dispatcher::new(
            registry.clone(),
            staging.clone(),
            DispatchLimits {
                max_upload_bytes: config.max_upload_size_bytes(),
                handler_timeout: config.handler_timeout(),
                cleanup_grace: config.cleanup_grace(),
            },
        );
        Self {
            config,
            registry,
            staging,
            dispatcher,
            started_at: Utc::now(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.config.is_production()
    }
}
