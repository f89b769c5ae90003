use std::{sync::Arc, time::Duration};

use maintainer_assist_gateway::{
    backend::{mock::MockBackend, BackendError},
    breaker::{BreakerConfig, BreakerState},
    config::OrchestratorConfig,
    metrics::AppMetrics,
    models::{AssistRequest, AttemptOutcome, BackendDescriptor, FALLBACK_BACKEND_ID, FALLBACK_TEXT},
    orchestrator::{Orchestrator, RegisteredBackend},
};
use tokio::{
    sync::Barrier,
    time::{sleep, timeout, Instant},
};

const QUESTION: &str = "How do I reset the tripped breaker on conveyor line 3?";
const GOOD_ANSWER: &str = "Lock out the panel first, then inspect the conveyor motor for overload. \
                           Reset the tripped breaker and run line 3 empty for two minutes before \
                           loading product again.";
const WEAK_ANSWER: &str = "I'm not sure.";

fn register(id: &str, backend: &MockBackend, base_weight: f64) -> RegisteredBackend {
    RegisteredBackend::new(
        BackendDescriptor::new(id, ["troubleshooting"], base_weight, false),
        Arc::new(backend.clone()),
    )
}

fn orchestrator(backends: Vec<RegisteredBackend>, config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::new(backends, &config, Arc::new(AppMetrics::new())).expect("valid orchestrator")
}

fn fragile(
    failure_threshold: u32,
    recovery_timeout: Duration,
    rate_limit_recovery: Duration,
) -> OrchestratorConfig {
    OrchestratorConfig {
        breaker: BreakerConfig {
            failure_threshold,
            recovery_timeout,
            rate_limit_recovery,
        },
        ..OrchestratorConfig::default()
    }
}

fn question() -> AssistRequest {
    AssistRequest::new(QUESTION, ["troubleshooting"])
}

#[tokio::test]
async fn single_backend_timeout_degrades_without_opening_breaker() {
    let only = MockBackend::named("only").failing(BackendError::Timeout("slow link".to_owned()));
    let orchestrator = orchestrator(
        vec![register("only", &only, 1.0)],
        OrchestratorConfig::default(),
    );

    let report = orchestrator.answer_with_report(&question()).await;

    assert!(report.degraded());
    assert_eq!(report.answer.backend_id, FALLBACK_BACKEND_ID);
    assert_eq!(report.answer.text, FALLBACK_TEXT);
    assert_eq!(report.answer.quality_score, 0.0);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Timeout);

    let breaker = orchestrator.breaker("only").expect("breaker").snapshot();
    assert_eq!(breaker.consecutive_failures, 1);
    assert_eq!(breaker.state, BreakerState::Closed);
}

#[tokio::test]
async fn accepted_answer_stops_fallback() {
    let first = MockBackend::named("backend-1").replying(GOOD_ANSWER);
    let second = MockBackend::named("backend-2").replying(GOOD_ANSWER);
    let orchestrator = orchestrator(
        vec![register("backend-1", &first, 2.0), register("backend-2", &second, 1.0)],
        OrchestratorConfig::default(),
    );

    let report = orchestrator.answer_with_report(&question()).await;

    assert_eq!(report.answer.backend_id, "backend-1");
    assert!(report.answer.quality_score >= 0.7);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 0);
}

#[tokio::test]
async fn better_later_answer_replaces_weak_best_so_far() {
    let first = MockBackend::named("backend-1").replying(WEAK_ANSWER);
    let second = MockBackend::named("backend-2").replying(GOOD_ANSWER);
    let orchestrator = orchestrator(
        vec![register("backend-1", &first, 2.0), register("backend-2", &second, 1.0)],
        OrchestratorConfig::default(),
    );

    let report = orchestrator.answer_with_report(&question()).await;

    assert_eq!(report.answer.backend_id, "backend-2");
    assert_eq!(report.answer.text, GOOD_ANSWER);
    assert_eq!(report.attempts.len(), 2);
    let first_quality = report.attempts[0].quality_score.expect("scored");
    assert!(first_quality < 0.7, "weak answer scored {first_quality}");
    assert!(report.attempts.iter().all(|a| a.outcome == AttemptOutcome::Success));
}

#[tokio::test]
async fn repeated_request_is_served_from_cache() {
    let backend = MockBackend::named("backend-1").replying(GOOD_ANSWER);
    let orchestrator = orchestrator(
        vec![register("backend-1", &backend, 1.0)],
        OrchestratorConfig::default(),
    );

    let first = orchestrator.answer_with_report(&question()).await;
    let reformatted = AssistRequest::new(
        "  how do I   RESET the tripped breaker on conveyor line 3? ",
        ["Troubleshooting"],
    );
    let second = orchestrator.answer_with_report(&reformatted).await;

    assert!(!first.cached);
    assert!(second.cached);
    assert!(second.attempts.is_empty());
    assert_eq!(second.answer, first.answer);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn total_failure_returns_uncached_fallback() {
    let rate_limited =
        MockBackend::named("cloud").failing(BackendError::RateLimited("quota".to_owned()));
    let broken = MockBackend::named("local")
        .failing(BackendError::MalformedResponse("missing choices".to_owned()));
    let orchestrator = orchestrator(
        vec![register("cloud", &rate_limited, 2.0), register("local", &broken, 1.0)],
        OrchestratorConfig::default(),
    );

    let report = orchestrator.answer_with_report(&question()).await;

    assert!(report.answer.is_degraded());
    assert_eq!(report.attempts.len(), 2);
    assert!(report
        .attempts
        .iter()
        .all(|attempt| attempt.outcome == AttemptOutcome::Error));
    assert!(orchestrator.cache().is_empty().await);

    orchestrator.answer(&question()).await;
    assert_eq!(rate_limited.calls(), 2);
}

#[tokio::test]
async fn weak_best_effort_answer_is_returned_but_not_cached() {
    let backend = MockBackend::named("only").replying(WEAK_ANSWER);
    let orchestrator = orchestrator(
        vec![register("only", &backend, 1.0)],
        OrchestratorConfig::default(),
    );

    let answer = orchestrator.answer(&question()).await;
    assert_eq!(answer.backend_id, "only");
    assert!(answer.quality_score < 0.7);

    orchestrator.answer(&question()).await;
    assert_eq!(backend.calls(), 2);
    assert!(orchestrator.cache().is_empty().await);
}

#[tokio::test]
async fn open_breaker_rejects_without_dispatch() {
    let config = OrchestratorConfig {
        breaker: BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        },
        ..OrchestratorConfig::default()
    };
    let flaky =
        MockBackend::named("flaky").failing(BackendError::Unavailable("503".to_owned()));
    let orchestrator = orchestrator(vec![register("flaky", &flaky, 1.0)], config);

    let first = orchestrator.answer_with_report(&question()).await;
    assert!(first.degraded());
    assert_eq!(
        orchestrator.breaker("flaky").expect("breaker").snapshot().state,
        BreakerState::Open
    );

    let second = orchestrator.answer_with_report(&question()).await;
    assert!(second.degraded());
    assert_eq!(second.attempts.len(), 1);
    assert_eq!(second.attempts[0].outcome, AttemptOutcome::Rejected);
    assert_eq!(second.attempts[0].latency, Duration::ZERO);
    assert_eq!(second.dispatched(), 0);
    assert_eq!(flaky.calls(), 1);
}

#[tokio::test]
async fn caller_deadline_abandons_slow_candidates() {
    let slow = MockBackend::named("slow")
        .replying(GOOD_ANSWER)
        .with_delay(Duration::from_secs(5));
    let spare = MockBackend::named("spare").replying(GOOD_ANSWER);
    let orchestrator = orchestrator(
        vec![register("slow", &slow, 2.0), register("spare", &spare, 1.0)],
        OrchestratorConfig::default(),
    );

    let started = Instant::now();
    let report = orchestrator
        .answer_within(&question(), started + Duration::from_millis(100))
        .await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.degraded());
    assert!(report.attempts.is_empty());
    assert_eq!(spare.calls(), 0);
    assert!(orchestrator.cache().is_empty().await);
}

#[tokio::test]
async fn outcomes_move_live_weights() {
    let good = MockBackend::named("good").replying(GOOD_ANSWER);
    let orchestrator = orchestrator(
        vec![register("good", &good, 1.0)],
        OrchestratorConfig::default(),
    );

    orchestrator.answer(&question()).await;

    let weights = orchestrator.policy().weights("good").expect("known backend");
    assert!(weights.weight > 1.0);
    assert_eq!(weights.success_rate, 1.0);

    let statuses = orchestrator.backend_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].breaker, BreakerState::Closed);
    assert_eq!(statuses[0].weight, weights.weight);
}

#[tokio::test]
async fn dropped_caller_during_half_open_trial_does_not_wedge_breaker() {
    let flaky = MockBackend::named("flaky")
        .replying(GOOD_ANSWER)
        .with_delay(Duration::from_millis(200))
        .scripted([Err(BackendError::Unavailable("503".to_owned()))]);
    let orchestrator = orchestrator(
        vec![register("flaky", &flaky, 1.0)],
        fragile(1, Duration::from_millis(50), Duration::from_millis(50)),
    );

    assert!(orchestrator.answer(&question()).await.is_degraded());
    sleep(Duration::from_millis(80)).await;

    // The caller gives up while holding the half-open trial.
    let abandoned = timeout(Duration::from_millis(20), orchestrator.answer(&question())).await;
    assert!(abandoned.is_err());

    let report = orchestrator.answer_with_report(&question()).await;

    assert!(!report.degraded());
    assert_eq!(report.answer.backend_id, "flaky");
    assert_eq!(report.dispatched(), 1);
    assert_eq!(flaky.calls(), 3);
    assert_eq!(
        orchestrator.breaker("flaky").expect("breaker").snapshot().state,
        BreakerState::Closed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_are_all_counted() {
    const CALLERS: usize = 8;
    let broken = MockBackend::named("broken")
        .failing(BackendError::Unavailable("503".to_owned()))
        .with_delay(Duration::from_millis(20));
    let orchestrator = Arc::new(orchestrator(
        vec![register("broken", &broken, 1.0)],
        fragile(1_000, Duration::from_secs(20), Duration::from_secs(5)),
    ));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles = (0..CALLERS)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                orchestrator.answer_with_report(&question()).await
            })
        })
        .collect::<Vec<_>>();
    let mut dispatched = 0;
    for handle in handles {
        dispatched += handle.await.expect("caller task").dispatched();
    }

    assert_eq!(dispatched, CALLERS);
    assert_eq!(broken.calls(), CALLERS);
    let snapshot = orchestrator.breaker("broken").expect("breaker").snapshot();
    assert_eq!(snapshot.consecutive_failures as usize, CALLERS);
    assert_eq!(snapshot.state, BreakerState::Closed);
    let weights = orchestrator.policy().weights("broken").expect("known backend");
    assert!((weights.weight - 0.2).abs() < 1e-9, "weight was {}", weights.weight);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_concurrent_caller_runs_the_half_open_trial() {
    const CALLERS: usize = 6;
    let flaky = MockBackend::named("flaky")
        .replying(GOOD_ANSWER)
        .with_delay(Duration::from_millis(100))
        .scripted([Err(BackendError::Unavailable("503".to_owned()))]);
    let orchestrator = Arc::new(orchestrator(
        vec![register("flaky", &flaky, 1.0)],
        fragile(1, Duration::from_millis(50), Duration::from_millis(50)),
    ));

    assert!(orchestrator.answer(&question()).await.is_degraded());
    sleep(Duration::from_millis(80)).await;

    let barrier = Arc::new(Barrier::new(CALLERS));
    let handles = (0..CALLERS)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                orchestrator.answer_with_report(&question()).await
            })
        })
        .collect::<Vec<_>>();
    let mut reports = Vec::with_capacity(CALLERS);
    for handle in handles {
        reports.push(handle.await.expect("caller task"));
    }

    let trial_runners = reports
        .iter()
        .filter(|report| report.dispatched() == 1)
        .count();
    assert_eq!(trial_runners, 1);
    assert_eq!(flaky.calls(), 2);
    assert!(reports
        .iter()
        .filter(|report| report.dispatched() == 0 && !report.cached)
        .all(|report| report.attempts[0].outcome == AttemptOutcome::Rejected));
}

#[tokio::test]
async fn rate_limited_opening_recovers_after_shorter_cooldown() {
    let throttled = MockBackend::named("throttled")
        .replying(GOOD_ANSWER)
        .scripted([Err(BackendError::RateLimited("429".to_owned()))]);
    let orchestrator = orchestrator(
        vec![register("throttled", &throttled, 1.0)],
        fragile(1, Duration::from_secs(60), Duration::from_millis(50)),
    );

    assert!(orchestrator.answer(&question()).await.is_degraded());
    assert_eq!(
        orchestrator.breaker("throttled").expect("breaker").snapshot().state,
        BreakerState::Open
    );
    sleep(Duration::from_millis(100)).await;

    let report = orchestrator.answer_with_report(&question()).await;

    assert_eq!(report.answer.backend_id, "throttled");
    assert_eq!(report.dispatched(), 1);
    assert_eq!(throttled.calls(), 2);
}

#[tokio::test]
async fn dispatch_stops_at_max_candidates() {
    let backends = ["first", "second", "third", "fourth"]
        .into_iter()
        .map(|id| {
            MockBackend::named(id).failing(BackendError::Unavailable("503".to_owned()))
        })
        .collect::<Vec<_>>();
    let config = OrchestratorConfig {
        max_candidates: 2,
        ..OrchestratorConfig::default()
    };
    let orchestrator = orchestrator(
        vec![
            register("first", &backends[0], 4.0),
            register("second", &backends[1], 3.0),
            register("third", &backends[2], 2.0),
            register("fourth", &backends[3], 1.0),
        ],
        config,
    );

    let report = orchestrator.answer_with_report(&question()).await;

    assert!(report.degraded());
    let tried = report
        .attempts
        .iter()
        .map(|attempt| attempt.backend_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(tried, vec!["first", "second"]);
    let calls = backends.iter().map(MockBackend::calls).collect::<Vec<_>>();
    assert_eq!(calls, vec![1, 1, 0, 0]);
}

