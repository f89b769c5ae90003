use std::sync::Arc;

use crate::{
    config::OrchestratorConfig,
    errors::ConfigError,
    metrics::AppMetrics,
    orchestrator::{Orchestrator, RegisteredBackend},
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<AppMetrics>,
}

impl AppState {
    pub fn new(
        backends: Vec<RegisteredBackend>,
        config: &OrchestratorConfig,
    ) -> Result<Self, ConfigError> {
        let metrics = Arc::new(AppMetrics::new());
        let orchestrator = Orchestrator::new(backends, config, metrics.clone())?;
        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            metrics,
        })
    }

    /// Default tunables, ignoring the process environment.
    pub fn new_for_tests(backends: Vec<RegisteredBackend>) -> Result<Self, ConfigError> {
        Self::new(backends, &OrchestratorConfig::default())
    }
}
