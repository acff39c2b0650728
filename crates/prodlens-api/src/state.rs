//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use prodlens_chat::ChatOrchestrator;
use prodlens_core::config::ApiConfig;

/// Shared application state. Cloned per request; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    /// Listen address, also used to build the CORS allow-list.
    pub api: ApiConfig,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<ChatOrchestrator>, api: ApiConfig) -> Self {
        Self {
            orchestrator,
            api,
            start_time: Instant::now(),
        }
    }
}
