use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tracing::debug;

use crate::{
    breaker::BreakerState,
    config::read_env,
    models::{AssistRequest, BackendDescriptor},
};

pub const MIN_WEIGHT_FACTOR: f64 = 0.1;
pub const MAX_WEIGHT_FACTOR: f64 = 10.0;

#[derive(Debug, Clone, Copy)]
pub struct PolicyConfig {
    /// Weight nudge per outcome, as a fraction of the backend's base weight.
    pub weight_step: f64,
    /// Latency hints at or below this drop remote backends from the ranking.
    pub local_only_hint: Duration,
    pub success_decay: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            weight_step: 0.1,
            local_only_hint: Duration::from_millis(750),
            success_decay: 0.8,
        }
    }
}

impl PolicyConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            weight_step: read_env("ASSIST_WEIGHT_STEP", defaults.weight_step),
            local_only_hint: Duration::from_millis(read_env(
                "ASSIST_LOCAL_ONLY_HINT_MS",
                defaults.local_only_hint.as_millis() as u64,
            )),
            success_decay: defaults.success_decay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightSignal {
    /// Success with an accepted answer.
    Reward,
    /// Failure, timeout or an answer below the acceptance threshold.
    Penalty,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSnapshot {
    pub weight: f64,
    pub effective_weight: f64,
    pub success_rate: f64,
}

/// Orders candidate backends per request and keeps their live weights.
pub struct SelectionPolicy {
    descriptors: Vec<BackendDescriptor>,
    stats: HashMap<String, Mutex<BackendStats>>,
    config: PolicyConfig,
}

#[derive(Debug, Clone, Copy)]
struct BackendStats {
    weight: f64,
    success_rate: f64,
}

struct Candidate<'a> {
    id: &'a str,
    open: bool,
    matched: bool,
    effective_weight: f64,
    is_local: bool,
}

impl SelectionPolicy {
    pub fn new(descriptors: Vec<BackendDescriptor>, config: PolicyConfig) -> Self {
        let stats = descriptors
            .iter()
            .map(|descriptor| {
                (
                    descriptor.id.clone(),
                    Mutex::new(BackendStats {
                        weight: descriptor.base_weight,
                        success_rate: 1.0,
                    }),
                )
            })
            .collect();

        Self {
            descriptors,
            stats,
            config,
        }
    }

    pub fn descriptors(&self) -> &[BackendDescriptor] {
        &self.descriptors
    }

    /// Every eligible backend id exactly once: open breakers last, then tag
    /// matches ahead of the rest, then by effective weight, locality and id.
    pub fn rank(
        &self,
        request: &AssistRequest,
        breaker_states: &HashMap<String, BreakerState>,
    ) -> Vec<String> {
        let tags = request.context_tags();
        let any_match = self
            .descriptors
            .iter()
            .any(|descriptor| descriptor.matches(tags));
        let local_only = request
            .max_latency_hint()
            .is_some_and(|hint| hint <= self.config.local_only_hint)
            && self.descriptors.iter().any(|descriptor| descriptor.is_local);

        let mut candidates = self
            .descriptors
            .iter()
            .filter(|descriptor| !local_only || descriptor.is_local)
            .map(|descriptor| Candidate {
                id: &descriptor.id,
                open: breaker_states.get(&descriptor.id) == Some(&BreakerState::Open),
                matched: !any_match || descriptor.matches(tags),
                effective_weight: self.snapshot(descriptor).effective_weight,
                is_local: descriptor.is_local,
            })
            .collect::<Vec<_>>();
        candidates.sort_by(compare_candidates);

        let ranked = candidates
            .into_iter()
            .map(|candidate| candidate.id.to_owned())
            .collect::<Vec<_>>();
        debug!(
            request_id = %request.request_id(),
            local_only,
            ranked = %ranked.join(","),
            "candidates ranked"
        );
        ranked
    }

    pub fn record(&self, backend_id: &str, signal: WeightSignal) {
        let (Some(descriptor), Some(stats)) = (
            self.descriptor(backend_id),
            self.stats.get(backend_id),
        ) else {
            return;
        };

        let step = self.config.weight_step * descriptor.base_weight;
        let decay = self.config.success_decay;
        let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
        let (weight, observed) = match signal {
            WeightSignal::Reward => (stats.weight + step, 1.0),
            WeightSignal::Penalty => (stats.weight - step, 0.0),
        };
        stats.weight = clamp_weight(weight, descriptor.base_weight);
        stats.success_rate = decay * stats.success_rate + (1.0 - decay) * observed;
    }

    pub fn weights(&self, backend_id: &str) -> Option<WeightSnapshot> {
        self.descriptor(backend_id)
            .map(|descriptor| self.snapshot(descriptor))
    }

    fn descriptor(&self, backend_id: &str) -> Option<&BackendDescriptor> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.id == backend_id)
    }

    fn snapshot(&self, descriptor: &BackendDescriptor) -> WeightSnapshot {
        let stats = self
            .stats
            .get(&descriptor.id)
            .map(|stats| *stats.lock().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or(BackendStats {
                weight: descriptor.base_weight,
                success_rate: 1.0,
            });

        WeightSnapshot {
            weight: stats.weight,
            effective_weight: clamp_weight(
                stats.weight * recency_decay(stats.success_rate),
                descriptor.base_weight,
            ),
            success_rate: stats.success_rate,
        }
    }
}

fn recency_decay(success_rate: f64) -> f64 {
    0.5 + 0.5 * success_rate.clamp(0.0, 1.0)
}

fn clamp_weight(weight: f64, base_weight: f64) -> f64 {
    weight.clamp(
        MIN_WEIGHT_FACTOR * base_weight,
        MAX_WEIGHT_FACTOR * base_weight,
    )
}

fn compare_candidates(left: &Candidate<'_>, right: &Candidate<'_>) -> Ordering {
    left.open
        .cmp(&right.open)
        .then(right.matched.cmp(&left.matched))
        .then(right.effective_weight.total_cmp(&left.effective_weight))
        .then(right.is_local.cmp(&left.is_local))
        .then(left.id.cmp(right.id))
}
