use std::{collections::HashSet, env, fs, str::FromStr, sync::Arc, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    backend::{mock::MockBackend, ollama::OllamaAdapter, openai::OpenAiAdapter, InferenceBackend},
    breaker::BreakerConfig,
    cache::CacheConfig,
    errors::ConfigError,
    models::BackendDescriptor,
    orchestrator::RegisteredBackend,
    policy::PolicyConfig,
};

const DEFAULT_ADAPTER_TIMEOUT_SECS: u64 = 60;

/// Global tunables, read once at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub breaker: BreakerConfig,
    pub policy: PolicyConfig,
    pub cache: CacheConfig,
    pub acceptance_threshold: f64,
    pub attempt_timeout: Duration,
    pub max_candidates: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            policy: PolicyConfig::default(),
            cache: CacheConfig::default(),
            acceptance_threshold: 0.7,
            attempt_timeout: Duration::from_secs(20),
            max_candidates: 4,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            breaker: BreakerConfig::from_env(),
            policy: PolicyConfig::from_env(),
            cache: CacheConfig::from_env(),
            acceptance_threshold: read_env(
                "ASSIST_ACCEPTANCE_THRESHOLD",
                defaults.acceptance_threshold,
            ),
            attempt_timeout: Duration::from_millis(read_env(
                "ASSIST_ATTEMPT_TIMEOUT_MS",
                defaults.attempt_timeout.as_millis() as u64,
            )),
            max_candidates: read_env("ASSIST_MAX_CANDIDATES", defaults.max_candidates),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.acceptance_threshold) {
            return Err(invalid(
                "ASSIST_ACCEPTANCE_THRESHOLD",
                format!("{} is outside [0, 1]", self.acceptance_threshold),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("ASSIST_FAILURE_THRESHOLD", "must be at least 1".to_owned()));
        }
        if self.attempt_timeout.is_zero() {
            return Err(invalid("ASSIST_ATTEMPT_TIMEOUT_MS", "must be positive".to_owned()));
        }
        if self.max_candidates == 0 {
            return Err(invalid("ASSIST_MAX_CANDIDATES", "must be at least 1".to_owned()));
        }
        if self.cache.min_ttl > self.cache.max_ttl {
            return Err(invalid(
                "ASSIST_CACHE_MIN_TTL_SECS",
                "exceeds ASSIST_CACHE_MAX_TTL_SECS".to_owned(),
            ));
        }
        if !self.policy.weight_step.is_finite() || self.policy.weight_step <= 0.0 {
            return Err(invalid("ASSIST_WEIGHT_STEP", "must be positive".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    OpenAi,
    Ollama,
    Mock,
}

/// One entry of the `ASSIST_BACKENDS` JSON array.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendEntry {
    pub id: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub supports_tags: Vec<String>,
    #[serde(default = "default_base_weight")]
    pub base_weight: f64,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_base_weight() -> f64 {
    1.0
}

impl BackendEntry {
    pub fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new(
            self.id.clone(),
            &self.supports_tags,
            self.base_weight,
            self.is_local,
        )
    }

    pub fn build_adapter(&self) -> Result<Arc<dyn InferenceBackend>, ConfigError> {
        let timeout =
            Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_ADAPTER_TIMEOUT_SECS));
        let adapter: Arc<dyn InferenceBackend> = match self.kind {
            BackendKind::OpenAi => {
                let key_var = self.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
                let api_key = env::var(key_var)
                    .ok()
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| self.invalid(format!("{key_var} is not set")))?;
                Arc::new(
                    OpenAiAdapter::new(
                        self.id.clone(),
                        self.base_url.as_deref(),
                        api_key,
                        self.model.as_deref(),
                        timeout,
                    )
                    .map_err(|reason| self.invalid(reason))?,
                )
            }
            BackendKind::Ollama => Arc::new(
                OllamaAdapter::new(
                    self.id.clone(),
                    self.base_url.as_deref(),
                    self.model.as_deref(),
                    timeout,
                )
                .map_err(|reason| self.invalid(reason))?,
            ),
            BackendKind::Mock => Arc::new(MockBackend::named(self.id.clone())),
        };
        Ok(adapter)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(self.invalid("id must not be empty".to_owned()));
        }
        if !self.base_weight.is_finite() || self.base_weight <= 0.0 {
            return Err(self.invalid(format!(
                "base_weight must be positive, got {}",
                self.base_weight
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> ConfigError {
        ConfigError::InvalidBackend {
            id: self.id.clone(),
            reason,
        }
    }
}

pub fn parse_backend_entries(raw: &str) -> Result<Vec<BackendEntry>, ConfigError> {
    let entries: Vec<BackendEntry> = serde_json::from_str(raw)?;
    let mut seen = HashSet::new();
    for entry in &entries {
        entry.validate()?;
        if !seen.insert(entry.id.as_str()) {
            return Err(ConfigError::DuplicateBackend(entry.id.clone()));
        }
    }
    Ok(entries)
}

/// Backend list from `ASSIST_BACKENDS`, then `ASSIST_BACKENDS_FILE`, then a lone
/// OpenAI backend when `OPENAI_API_KEY` is set. May be empty.
pub fn load_backends() -> Result<Vec<RegisteredBackend>, ConfigError> {
    let entries = if let Some(raw) = non_empty_var("ASSIST_BACKENDS") {
        parse_backend_entries(&raw)?
    } else if let Some(path) = non_empty_var("ASSIST_BACKENDS_FILE") {
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        parse_backend_entries(&raw)?
    } else {
        return openai_from_env();
    };

    entries
        .iter()
        .map(|entry| -> Result<RegisteredBackend, ConfigError> {
            let adapter = entry.build_adapter()?;
            info!(
                backend = %entry.id,
                kind = ?entry.kind,
                is_local = entry.is_local,
                base_weight = entry.base_weight,
                "backend configured"
            );
            Ok(RegisteredBackend::new(entry.descriptor(), adapter))
        })
        .collect()
}

fn openai_from_env() -> Result<Vec<RegisteredBackend>, ConfigError> {
    let adapter = OpenAiAdapter::from_env().map_err(|reason| ConfigError::InvalidBackend {
        id: "openai".to_owned(),
        reason,
    })?;
    Ok(adapter
        .map(|adapter| {
            let descriptor = BackendDescriptor::new("openai", Vec::<String>::new(), 1.0, false);
            RegisteredBackend::new(descriptor, Arc::new(adapter))
        })
        .into_iter()
        .collect())
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Unset or unparsable values fall back to `default`.
pub(crate) fn read_env<T: FromStr>(name: &str, default: T) -> T {
    let Some(value) = non_empty_var(name) else {
        return default;
    };
    match value.trim().parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(variable = name, value = %value, "unparsable setting, using default");
            default
        }
    }
}

fn invalid(name: &'static str, reason: String) -> ConfigError {
    ConfigError::InvalidSetting { name, reason }
}
