pub mod mock;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::models::{AssistRequest, AttemptOutcome};

/// One external inference backend. Adapters only translate wire formats; retry,
/// timeout and fallback decisions belong to the orchestrator.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn id(&self) -> &str;
    async fn send(&self, request: &AssistRequest) -> Result<BackendReply, BackendError>;
}

#[derive(Debug, Clone)]
pub struct BackendReply {
    pub text: String,
    pub metadata: ReplyMetadata,
}

impl BackendReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: ReplyMetadata::default(),
        }
    }
}

/// Adapter-local details. Logged, never interpreted by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ReplyMetadata {
    pub model: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend rate limited: {0}")]
    RateLimited(String),
    #[error("backend malformed response: {0}")]
    MalformedResponse(String),
}

impl BackendError {
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Timeout(_) => AttemptOutcome::Timeout,
            Self::Unavailable(_) | Self::RateLimited(_) | Self::MalformedResponse(_) => {
                AttemptOutcome::Error
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::RateLimited(_) => "rate_limited",
            Self::MalformedResponse(_) => "malformed_response",
        }
    }
}

pub(crate) fn system_prompt(request: &AssistRequest) -> String {
    let mut prompt = String::from(
        "You are a maintenance assistant for a computerized maintenance management system. \
         Answer concisely with practical, safe steps for technicians. Mention lockout/tagout \
         whenever work on energized equipment is involved.",
    );
    if !request.context_tags().is_empty() {
        let tags = request
            .context_tags()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        prompt.push_str(" Context: ");
        prompt.push_str(&tags);
        prompt.push('.');
    }
    prompt
}

pub(crate) fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited(trimmed),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Timeout(format!("upstream timeout: {trimmed}"))
        }
        status if status.is_server_error() => {
            BackendError::Unavailable(format!("status {}: {trimmed}", status.as_u16()))
        }
        _ => BackendError::MalformedResponse(format!("status {}: {trimmed}", status.as_u16())),
    }
}

pub(crate) fn map_transport_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else if error.is_decode() {
        BackendError::MalformedResponse(error.to_string())
    } else {
        BackendError::Unavailable(error.to_string())
    }
}
