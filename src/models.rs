use std::{
    collections::BTreeSet,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::breaker::BreakerState;

pub const FALLBACK_BACKEND_ID: &str = "fallback-static";

pub const FALLBACK_TEXT: &str = "I'm unable to get a confident answer right now. Please try again \
shortly or consult the equipment manual and your maintenance lead.";

/// A maintenance question as handed over by the CMMS application layer.
#[derive(Debug, Clone)]
pub struct AssistRequest {
    request_id: String,
    text: String,
    context_tags: BTreeSet<String>,
    max_latency_hint: Option<Duration>,
}

impl AssistRequest {
    pub fn new<I, S>(text: impl Into<String>, context_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let context_tags = context_tags
            .into_iter()
            .filter_map(|tag| normalize_tag(tag.as_ref()))
            .collect();

        Self {
            request_id: format!("req_{}", Uuid::new_v4()),
            text: text.into(),
            context_tags,
            max_latency_hint: None,
        }
    }

    pub fn with_latency_hint(mut self, hint: Duration) -> Self {
        self.max_latency_hint = Some(hint);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn context_tags(&self) -> &BTreeSet<String> {
        &self.context_tags
    }

    pub fn max_latency_hint(&self) -> Option<Duration> {
        self.max_latency_hint
    }
}

pub fn normalize_tag(tag: &str) -> Option<String> {
    let tag = tag.trim();
    if tag.is_empty() {
        return None;
    }
    Some(tag.to_lowercase())
}

/// Static description of one configured inference backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDescriptor {
    pub id: String,
    pub supports_tags: BTreeSet<String>,
    pub base_weight: f64,
    pub is_local: bool,
}

impl BackendDescriptor {
    pub fn new<I, S>(id: impl Into<String>, supports_tags: I, base_weight: f64, is_local: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            id: id.into(),
            supports_tags: supports_tags
                .into_iter()
                .filter_map(|tag| normalize_tag(tag.as_ref()))
                .collect(),
            base_weight,
            is_local,
        }
    }

    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        !self.supports_tags.is_disjoint(tags)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub backend_id: String,
    pub text: String,
    pub quality_score: f64,
    pub latency: Duration,
    pub produced_at: i64,
}

impl Answer {
    pub fn degraded() -> Self {
        Self {
            backend_id: FALLBACK_BACKEND_ID.to_owned(),
            text: FALLBACK_TEXT.to_owned(),
            quality_score: 0.0,
            latency: Duration::ZERO,
            produced_at: unix_timestamp(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.backend_id == FALLBACK_BACKEND_ID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    Error,
    Rejected,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Rejected => "rejected",
        }
    }
}

/// One candidate tried (or skipped by its breaker) during a single orchestration.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub backend_id: String,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
    pub quality_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OrchestrationReport {
    pub request_id: String,
    pub answer: Answer,
    pub attempts: Vec<AttemptRecord>,
    pub cached: bool,
}

impl OrchestrationReport {
    pub fn degraded(&self) -> bool {
        self.answer.is_degraded()
    }

    pub fn dispatched(&self) -> usize {
        self.attempts
            .iter()
            .filter(|attempt| attempt.outcome != AttemptOutcome::Rejected)
            .count()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistApiRequest {
    pub query: String,
    #[serde(default)]
    pub context_tags: Vec<String>,
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
}

impl AssistApiRequest {
    pub fn into_request(self) -> Result<AssistRequest, String> {
        if self.query.trim().is_empty() {
            return Err("query must not be empty".to_owned());
        }

        let request = AssistRequest::new(self.query, self.context_tags);
        Ok(match self.max_latency_ms {
            Some(millis) => request.with_latency_hint(Duration::from_millis(millis)),
            None => request,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct AssistApiResponse {
    pub id: String,
    pub backend_id: String,
    pub text: String,
    pub quality_score: f64,
    pub latency_ms: u64,
    pub produced_at: i64,
    pub cached: bool,
    pub degraded: bool,
    pub attempts: Vec<AttemptView>,
}

#[derive(Debug, Serialize)]
pub struct AttemptView {
    pub backend_id: String,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

impl AssistApiResponse {
    pub fn from_report(report: OrchestrationReport) -> Self {
        let degraded = report.degraded();
        let attempts = report
            .attempts
            .into_iter()
            .map(|attempt| AttemptView {
                backend_id: attempt.backend_id,
                outcome: attempt.outcome,
                latency_ms: attempt.latency.as_millis() as u64,
                quality_score: attempt.quality_score,
            })
            .collect();

        Self {
            id: report.request_id,
            backend_id: report.answer.backend_id,
            text: report.answer.text,
            quality_score: report.answer.quality_score,
            latency_ms: report.answer.latency.as_millis() as u64,
            produced_at: report.answer.produced_at,
            cached: report.cached,
            degraded,
            attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatusView {
    pub id: String,
    pub is_local: bool,
    pub breaker: BreakerState,
    pub consecutive_failures: u32,
    pub base_weight: f64,
    pub weight: f64,
    pub effective_weight: f64,
    pub success_rate: f64,
}

pub fn unix_timestamp() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs() as i64
}
