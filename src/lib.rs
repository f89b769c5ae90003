pub mod backend;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod errors;
pub mod fingerprint;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod quality;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};
use tracing::info;

use crate::{
    config::{load_backends, OrchestratorConfig},
    errors::ConfigError,
};

pub fn build_state() -> Result<state::AppState, ConfigError> {
    let config = OrchestratorConfig::from_env()?;
    let backends = load_backends()?;

    let backend_ids = backends
        .iter()
        .map(|backend| backend.descriptor.id.as_str())
        .collect::<Vec<_>>()
        .join(",");
    info!(
        backends = %backend_ids,
        acceptance_threshold = config.acceptance_threshold,
        attempt_timeout_ms = config.attempt_timeout.as_millis() as u64,
        max_candidates = config.max_candidates,
        cache_capacity = config.cache.capacity,
        "orchestrator configured"
    );
    state::AppState::new(backends, &config)
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/backends", get(handlers::backends))
        .route("/v1/assist", post(handlers::assist))
        .with_state(state)
}
