use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{BackendError, BackendReply, InferenceBackend},
    breaker::{BreakerSignal, BreakerState, CircuitBreaker},
    cache::ResponseCache,
    config::OrchestratorConfig,
    errors::ConfigError,
    fingerprint::{fingerprint_for, RequestFingerprint},
    metrics::AppMetrics,
    models::{
        unix_timestamp, Answer, AssistRequest, AttemptOutcome, AttemptRecord, BackendDescriptor,
        BackendStatusView, OrchestrationReport,
    },
    policy::{SelectionPolicy, WeightSignal},
    quality,
};

/// A configured backend: its static descriptor plus the adapter that talks to it.
pub struct RegisteredBackend {
    pub descriptor: BackendDescriptor,
    pub adapter: Arc<dyn InferenceBackend>,
}

impl RegisteredBackend {
    pub fn new(descriptor: BackendDescriptor, adapter: Arc<dyn InferenceBackend>) -> Self {
        Self {
            descriptor,
            adapter,
        }
    }
}

pub struct Orchestrator {
    adapters: HashMap<String, Arc<dyn InferenceBackend>>,
    breakers: HashMap<String, CircuitBreaker>,
    policy: SelectionPolicy,
    cache: ResponseCache,
    metrics: Arc<AppMetrics>,
    acceptance_threshold: f64,
    attempt_timeout: Duration,
    max_candidates: usize,
}

enum Dispatch {
    Completed(Result<BackendReply, BackendError>),
    /// The caller's deadline passed while the call was in flight.
    Abandoned,
}

impl Orchestrator {
    pub fn new(
        backends: Vec<RegisteredBackend>,
        config: &OrchestratorConfig,
        metrics: Arc<AppMetrics>,
    ) -> Result<Self, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        config.validate()?;

        let mut adapters = HashMap::with_capacity(backends.len());
        let mut breakers = HashMap::with_capacity(backends.len());
        let mut descriptors = Vec::with_capacity(backends.len());
        for backend in backends {
            let id = backend.descriptor.id.clone();
            if adapters.contains_key(&id) {
                return Err(ConfigError::DuplicateBackend(id));
            }
            debug!(
                backend = %id,
                adapter = %backend.adapter.id(),
                is_local = backend.descriptor.is_local,
                "backend registered"
            );
            breakers.insert(id.clone(), CircuitBreaker::new(id.clone(), config.breaker));
            adapters.insert(id, backend.adapter);
            descriptors.push(backend.descriptor);
        }

        Ok(Self {
            adapters,
            breakers,
            policy: SelectionPolicy::new(descriptors, config.policy),
            cache: ResponseCache::new(config.cache),
            metrics,
            acceptance_threshold: config.acceptance_threshold,
            attempt_timeout: config.attempt_timeout,
            max_candidates: config.max_candidates,
        })
    }

    pub async fn answer(&self, request: &AssistRequest) -> Answer {
        self.answer_with_report(request).await.answer
    }

    pub async fn answer_with_report(&self, request: &AssistRequest) -> OrchestrationReport {
        self.orchestrate(request, None).await
    }

    /// Like [`answer_with_report`](Self::answer_with_report), but stops waiting on
    /// backends once `deadline` passes and returns whatever it has by then.
    pub async fn answer_within(
        &self,
        request: &AssistRequest,
        deadline: Instant,
    ) -> OrchestrationReport {
        self.orchestrate(request, Some(deadline)).await
    }

    pub fn breaker(&self, backend_id: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(backend_id)
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn backend_statuses(&self) -> Vec<BackendStatusView> {
        let mut statuses = Vec::with_capacity(self.policy.descriptors().len());
        for descriptor in self.policy.descriptors() {
            let Some(breaker) = self.breakers.get(&descriptor.id) else {
                continue;
            };
            let snapshot = breaker.snapshot();
            let weights = self.policy.weights(&descriptor.id);
            statuses.push(BackendStatusView {
                id: descriptor.id.clone(),
                is_local: descriptor.is_local,
                breaker: snapshot.state,
                consecutive_failures: snapshot.consecutive_failures,
                base_weight: descriptor.base_weight,
                weight: weights.map_or(descriptor.base_weight, |w| w.weight),
                effective_weight: weights.map_or(descriptor.base_weight, |w| w.effective_weight),
                success_rate: weights.map_or(1.0, |w| w.success_rate),
            });
        }
        statuses
    }

    async fn orchestrate(
        &self,
        request: &AssistRequest,
        deadline: Option<Instant>,
    ) -> OrchestrationReport {
        let started = Instant::now();
        let fingerprint = fingerprint_for(request);

        if let Some(answer) = self.cache.get(&fingerprint).await {
            info!(
                request_id = %request.request_id(),
                fingerprint = %fingerprint.as_str(),
                backend = %answer.backend_id,
                "answer served from cache"
            );
            return self.finish(request, answer, Vec::new(), true, started, "cached");
        }
        debug!(
            request_id = %request.request_id(),
            fingerprint = %fingerprint.as_str(),
            "cache miss"
        );

        let breaker_states = self.breaker_states(started);
        let ranked = self.policy.rank(request, &breaker_states);
        debug_assert!(
            !ranked.is_empty(),
            "selection policy returned no candidates for a non-empty backend set"
        );
        if ranked.is_empty() {
            error!(
                request_id = %request.request_id(),
                "selection policy returned no candidates"
            );
            return self.degrade(request, Vec::new(), started);
        }

        let attempt_timeout = self.attempt_timeout_for(request);
        let mut attempts = Vec::new();
        let mut best: Option<Answer> = None;

        for backend_id in ranked.iter().take(self.max_candidates) {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(
                    request_id = %request.request_id(),
                    "caller deadline reached, abandoning remaining candidates"
                );
                break;
            }
            let (Some(adapter), Some(breaker)) =
                (self.adapters.get(backend_id), self.breakers.get(backend_id))
            else {
                continue;
            };

            // Dropping the permit unrecorded (deadline or caller gone) frees a
            // half-open trial.
            let Some(permit) = breaker.acquire() else {
                debug!(backend = %backend_id, "candidate rejected by open breaker");
                self.metrics
                    .observe_attempt(backend_id, AttemptOutcome::Rejected, Duration::ZERO);
                attempts.push(AttemptRecord {
                    backend_id: backend_id.clone(),
                    outcome: AttemptOutcome::Rejected,
                    latency: Duration::ZERO,
                    quality_score: None,
                });
                continue;
            };

            let attempt_started = Instant::now();
            let result = match dispatch(adapter.as_ref(), request, attempt_timeout, deadline).await
            {
                Dispatch::Completed(result) => result,
                Dispatch::Abandoned => {
                    drop(permit);
                    warn!(
                        request_id = %request.request_id(),
                        backend = %backend_id,
                        "caller deadline reached mid-attempt, result discarded"
                    );
                    break;
                }
            };
            let latency = attempt_started.elapsed();

            match result {
                Ok(reply) => {
                    permit.record(BreakerSignal::Success);
                    let breakdown = quality::assess(request, &reply.text);
                    let quality_score = breakdown.total();
                    let accepted = quality_score >= self.acceptance_threshold;
                    self.policy.record(
                        backend_id,
                        if accepted {
                            WeightSignal::Reward
                        } else {
                            WeightSignal::Penalty
                        },
                    );
                    self.metrics
                        .observe_attempt(backend_id, AttemptOutcome::Success, latency);
                    attempts.push(AttemptRecord {
                        backend_id: backend_id.clone(),
                        outcome: AttemptOutcome::Success,
                        latency,
                        quality_score: Some(quality_score),
                    });
                    debug!(
                        request_id = %request.request_id(),
                        backend = %backend_id,
                        model = reply.metadata.model.as_deref().unwrap_or_default(),
                        quality = quality_score,
                        relevance = breakdown.relevance,
                        length = breakdown.length,
                        hedging = breakdown.hedging,
                        completeness = breakdown.completeness,
                        latency_ms = latency.as_millis() as u64,
                        accepted,
                        "attempt succeeded"
                    );

                    let answer = Answer {
                        backend_id: backend_id.clone(),
                        text: reply.text,
                        quality_score,
                        latency,
                        produced_at: unix_timestamp(),
                    };
                    if accepted {
                        self.store(fingerprint, &answer).await;
                        return self.finish(request, answer, attempts, false, started, "answered");
                    }
                    if best
                        .as_ref()
                        .map_or(true, |current| quality_score > current.quality_score)
                    {
                        best = Some(answer);
                    }
                }
                Err(error) => {
                    let signal = match error {
                        BackendError::RateLimited(_) => BreakerSignal::RateLimited,
                        _ => BreakerSignal::Failure,
                    };
                    if permit.record(signal) {
                        self.metrics.observe_breaker_open(backend_id);
                    }
                    self.policy.record(backend_id, WeightSignal::Penalty);
                    let outcome = error.outcome();
                    self.metrics.observe_attempt(backend_id, outcome, latency);
                    attempts.push(AttemptRecord {
                        backend_id: backend_id.clone(),
                        outcome,
                        latency,
                        quality_score: None,
                    });
                    warn!(
                        request_id = %request.request_id(),
                        backend = %backend_id,
                        kind = error.kind(),
                        error = %error,
                        latency_ms = latency.as_millis() as u64,
                        "attempt failed"
                    );
                }
            }
        }

        match best {
            Some(answer) => {
                info!(
                    request_id = %request.request_id(),
                    backend = %answer.backend_id,
                    quality = answer.quality_score,
                    threshold = self.acceptance_threshold,
                    "no answer reached the threshold, returning best so far"
                );
                self.finish(request, answer, attempts, false, started, "best_effort")
            }
            None => self.degrade(request, attempts, started),
        }
    }

    fn breaker_states(&self, now: Instant) -> HashMap<String, BreakerState> {
        self.breakers
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.state_at(now)))
            .collect()
    }

    fn attempt_timeout_for(&self, request: &AssistRequest) -> Duration {
        request
            .max_latency_hint()
            .map_or(self.attempt_timeout, |hint| hint.min(self.attempt_timeout))
    }

    async fn store(&self, fingerprint: RequestFingerprint, answer: &Answer) {
        let ttl = self.cache.config().ttl_for(answer.quality_score);
        debug!(
            fingerprint = %fingerprint.as_str(),
            ttl_secs = ttl.as_secs(),
            "caching accepted answer"
        );
        self.cache.put(fingerprint, answer.clone(), ttl).await;
    }

    fn degrade(
        &self,
        request: &AssistRequest,
        attempts: Vec<AttemptRecord>,
        started: Instant,
    ) -> OrchestrationReport {
        warn!(
            request_id = %request.request_id(),
            attempts = attempts.len(),
            "all candidates exhausted, serving degraded answer"
        );
        let answer = Answer {
            latency: started.elapsed(),
            ..Answer::degraded()
        };
        self.finish(request, answer, attempts, false, started, "degraded")
    }

    fn finish(
        &self,
        request: &AssistRequest,
        answer: Answer,
        attempts: Vec<AttemptRecord>,
        cached: bool,
        started: Instant,
        result: &str,
    ) -> OrchestrationReport {
        self.metrics.observe_orchestration(result, started.elapsed());
        OrchestrationReport {
            request_id: request.request_id().to_owned(),
            answer,
            attempts,
            cached,
        }
    }
}

async fn dispatch(
    adapter: &dyn InferenceBackend,
    request: &AssistRequest,
    attempt_timeout: Duration,
    deadline: Option<Instant>,
) -> Dispatch {
    let call = timeout(attempt_timeout, adapter.send(request));
    let result = match deadline {
        Some(deadline) => match timeout_at(deadline, call).await {
            Ok(result) => result,
            Err(_) => return Dispatch::Abandoned,
        },
        None => call.await,
    };

    Dispatch::Completed(result.unwrap_or_else(|_| {
        Err(BackendError::Timeout(format!(
            "no reply within {} ms",
            attempt_timeout.as_millis()
        )))
    }))
}
