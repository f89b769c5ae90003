use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

use crate::models::AttemptOutcome;

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    requests_total: IntCounterVec,
    orchestration_duration_seconds: HistogramVec,
    attempts_total: IntCounterVec,
    attempt_duration_seconds: HistogramVec,
    breaker_open_total: IntCounterVec,
}

pub struct InflightGuard<'a> {
    metrics: &'a AppMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            opts!(
                "assist_http_requests_total",
                "Total HTTP requests processed by the assist gateway"
            ),
            &["path", "method", "status"],
        )
        .expect("valid http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "assist_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["path", "method"],
        )
        .expect("valid http_request_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "assist_inflight_requests",
            "Current in-flight requests at the assist gateway",
        )
        .expect("valid inflight_requests metric");

        let requests_total = IntCounterVec::new(
            opts!(
                "assist_requests_total",
                "Orchestrations by result (answered, best_effort, degraded, cached)"
            ),
            &["result"],
        )
        .expect("valid requests_total metric");

        let orchestration_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "assist_orchestration_duration_seconds",
                "End-to-end orchestration latency in seconds",
            ),
            &["result"],
        )
        .expect("valid orchestration_duration_seconds metric");

        let attempts_total = IntCounterVec::new(
            opts!(
                "assist_attempts_total",
                "Backend attempts by backend and outcome"
            ),
            &["backend", "outcome"],
        )
        .expect("valid attempts_total metric");

        let attempt_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "assist_attempt_duration_seconds",
                "Backend attempt latency in seconds",
            ),
            &["backend"],
        )
        .expect("valid attempt_duration_seconds metric");

        let breaker_open_total = IntCounterVec::new(
            opts!(
                "assist_breaker_open_total",
                "Times a backend circuit breaker opened"
            ),
            &["backend"],
        )
        .expect("valid breaker_open_total metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("register http_requests_total");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("register http_request_duration_seconds");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("register requests_total");
        registry
            .register(Box::new(orchestration_duration_seconds.clone()))
            .expect("register orchestration_duration_seconds");
        registry
            .register(Box::new(attempts_total.clone()))
            .expect("register attempts_total");
        registry
            .register(Box::new(attempt_duration_seconds.clone()))
            .expect("register attempt_duration_seconds");
        registry
            .register(Box::new(breaker_open_total.clone()))
            .expect("register breaker_open_total");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            inflight_requests,
            requests_total,
            orchestration_duration_seconds,
            attempts_total,
            attempt_duration_seconds,
            breaker_open_total,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight_requests.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(&self, path: &str, method: &str, status: u16, duration: Duration) {
        let status_label = status.to_string();
        self.http_requests_total
            .with_label_values(&[path, method, &status_label])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[path, method])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_orchestration(&self, result: &str, duration: Duration) {
        self.requests_total.with_label_values(&[result]).inc();
        self.orchestration_duration_seconds
            .with_label_values(&[result])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_attempt(&self, backend: &str, outcome: AttemptOutcome, latency: Duration) {
        self.attempts_total
            .with_label_values(&[backend, outcome.as_str()])
            .inc();
        if outcome != AttemptOutcome::Rejected {
            self.attempt_duration_seconds
                .with_label_values(&[backend])
                .observe(latency.as_secs_f64());
        }
    }

    pub fn observe_breaker_open(&self, backend: &str) {
        self.breaker_open_total.with_label_values(&[backend]).inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}
