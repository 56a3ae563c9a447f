mod support;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use portl_core::types::FailureKind;
use portl_exec::connectors::{HttpResponseParts, StaticResolver};
use portl_exec::executor::Event;
use portl_exec::retry::{decide_retry, Attempt, RetryController, RetryDecision, RetryPolicy, RetryReason};
use portl_exec::{ConnectorError, EngineConfig, RunLimits, RunStatus, StepError};
use serde_json::json;
use support::{engine, engine_with, job, response, seed, FakeDb, FakeHttp};
use tokio_util::sync::CancellationToken;

fn policy(max_attempts: u32, backoff_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: Duration::from_millis(backoff_ms),
        retry_on: [FailureKind::Timeout, FailureKind::Http5xx, FailureKind::Http429]
            .into_iter()
            .collect::<BTreeSet<_>>(),
        explicit: false,
        jitter: false,
        max_delay: Duration::from_secs(60),
    }
}

fn no_rand() -> u64 {
    0
}

#[test]
fn backoff_doubles_per_attempt() {
    let p = policy(5, 100);
    let err = ConnectorError::new(FailureKind::Http5xx, "503");

    for (attempt_no, ms) in [(1, 100), (2, 200), (3, 400)] {
        assert_eq!(
            decide_retry(&p, attempt_no, &err, no_rand),
            RetryDecision::RetryAfter {
                delay: Duration::from_millis(ms),
                reason: RetryReason::Backoff
            }
        );
    }
}

#[test]
fn backoff_is_capped_by_max_delay() {
    let mut p = policy(20, 1000);
    p.max_delay = Duration::from_secs(5);
    let err = ConnectorError::new(FailureKind::Timeout, "slow");

    match decide_retry(&p, 10, &err, no_rand) {
        RetryDecision::RetryAfter { delay, .. } => assert_eq!(delay, Duration::from_secs(5)),
        other => panic!("expected a retry, got {other:?}"),
    }
}

#[test]
fn jitter_draws_within_the_backoff() {
    let mut p = policy(3, 100);
    p.jitter = true;
    let err = ConnectorError::new(FailureKind::Http5xx, "503");

    match decide_retry(&p, 2, &err, || 250) {
        // 250 % (200 + 1)
        RetryDecision::RetryAfter { delay, .. } => assert_eq!(delay, Duration::from_millis(49)),
        other => panic!("expected a retry, got {other:?}"),
    }
}

#[test]
fn retry_after_hint_wins_over_backoff() {
    let p = policy(3, 100);
    let err = ConnectorError::new(FailureKind::Http429, "slow down").with_retry_after(Some(Duration::from_secs(7)));

    assert_eq!(
        decide_retry(&p, 1, &err, no_rand),
        RetryDecision::RetryAfter {
            delay: Duration::from_secs(7),
            reason: RetryReason::RetryAfterHeader
        }
    );
}

#[test]
fn stops_when_attempts_are_exhausted() {
    let p = policy(3, 100);
    let err = ConnectorError::new(FailureKind::Http5xx, "503");

    assert_eq!(
        decide_retry(&p, 3, &err, no_rand),
        RetryDecision::Stop {
            reason: RetryReason::AttemptsExhausted
        }
    );
}

#[test]
fn kinds_outside_retry_on_are_not_retried() {
    let p = policy(3, 100);
    let err = ConnectorError::new(FailureKind::Http4xx, "404");

    assert_eq!(
        decide_retry(&p, 1, &err, no_rand),
        RetryDecision::Stop {
            reason: RetryReason::NotRetryable
        }
    );
}

#[test]
fn permanent_failures_need_an_explicit_retry_on() {
    let mut p = policy(3, 100);
    let err = ConnectorError::permanent(FailureKind::Http5xx, "501 not implemented");
    assert!(!p.retries(&err));

    p.explicit = true;
    assert!(p.retries(&err));
}

#[test]
fn constraint_violations_are_never_retried() {
    let mut p = policy(3, 100);
    p.retry_on.insert(FailureKind::DbConstraint);
    p.explicit = true;

    assert!(!p.retries(&ConnectorError::new(FailureKind::DbConstraint, "duplicate key")));
}

struct Flaky {
    failures_left: u32,
}

#[async_trait]
impl Attempt for Flaky {
    type Output = u32;

    async fn attempt(&mut self, attempt_no: u32) -> Result<u32, ConnectorError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(ConnectorError::new(FailureKind::Timeout, "timed out"));
        }
        Ok(attempt_no)
    }
}

#[tokio::test(start_paused = true)]
async fn n_minus_one_failures_still_succeed() {
    let p = policy(4, 50);
    let cancel = CancellationToken::new();
    let mut op = Flaky { failures_left: 3 };

    let started = tokio::time::Instant::now();
    let outcome = RetryController::new(&p, &cancel).run(&mut op).await;

    assert_eq!(outcome.result.unwrap(), 4);
    assert_eq!(outcome.attempts, 4);
    // 50 + 100 + 200; paused time makes the schedule exact
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(350), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(360), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn n_failures_exhaust_the_policy() {
    let p = policy(3, 50);
    let cancel = CancellationToken::new();
    let mut op = Flaky { failures_left: 3 };

    let outcome = RetryController::new(&p, &cancel).run(&mut op).await;

    match outcome.result {
        Err(StepError::RetryExhausted { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert_eq!(last.kind, FailureKind::Timeout);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_the_backoff_sleep() {
    let p = policy(5, 10_000);
    let cancel = CancellationToken::new();
    let mut op = Flaky { failures_left: 5 };

    let controller = RetryController::new(&p, &cancel);
    let (outcome, _) = tokio::join!(controller.run(&mut op), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });

    assert!(matches!(outcome.result, Err(StepError::Cancelled)));
    assert_eq!(outcome.attempts, 1);
}

const API_JOB: &str = r#"
id: retrying
connections:
  api: { type: http, config: { base_url: "https://api.example.com" } }
steps:
  - id: push
    type: api.call
    connection: api
    method: PUT
    path: /items/1
    idempotency_key: item-1
    retry: { max_attempts: 3, backoff_ms: 100 }
"#;

fn retry_delays(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StepRetryScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn api_call_retries_server_errors_with_backoff() {
    let http = FakeHttp::ok(json!({ "ok": true }))
        .then(Ok(response(503, json!({}))))
        .then(Ok(response(502, json!({}))));
    let resolver = StaticResolver::new().with("api", http.handle());
    let (engine, events) = engine(resolver);

    let started = tokio::time::Instant::now();
    let report = engine.run(&job(API_JOB), seed(json!({})), false).await.unwrap();

    assert_eq!(report.status, RunStatus::Committed);
    assert_eq!(report.step("push").unwrap().attempts, 3);
    assert_eq!(retry_delays(&events.events()), vec![100, 200]);
    assert!(started.elapsed() >= Duration::from_millis(300));

    let requests = http.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.headers["Idempotency-Key"] == "item-1"));
    assert_eq!(http.effects("Idempotency-Key"), 1);
}

#[tokio::test(start_paused = true)]
async fn api_call_honours_retry_after() {
    let mut throttled: HttpResponseParts = response(429, json!({}));
    throttled.headers.insert("Retry-After".to_string(), "2".to_string());
    let http = FakeHttp::ok(json!({})).then(Ok(throttled));
    let resolver = StaticResolver::new().with("api", http.handle());
    let (engine, events) = engine(resolver);

    let report = engine.run(&job(API_JOB), seed(json!({})), false).await.unwrap();

    assert_eq!(report.status, RunStatus::Committed);
    assert_eq!(retry_delays(&events.events()), vec![2000]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_abort_the_run() {
    let http = FakeHttp::with_handler(|_| Ok(response(503, json!({}))));
    let resolver = StaticResolver::new().with("api", http.handle());
    let (engine, _) = engine(resolver);

    let report = engine.run(&job(API_JOB), seed(json!({})), false).await.unwrap();

    assert_eq!(report.status, RunStatus::RolledBack);
    let error = report.error.unwrap();
    assert_eq!(error.error, "retry_exhausted");
    assert_eq!(error.kind, Some(FailureKind::Http5xx));
    assert_eq!(error.attempts, 3);
    assert_eq!(http.requests().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_run_rolls_it_back() {
    let http = FakeHttp::with_handler(|_| Ok(response(503, json!({}))));
    let resolver = StaticResolver::new().with("api", http.handle());
    let (engine, _) = engine(resolver);
    let yaml = API_JOB.replace("max_attempts: 3, backoff_ms: 100", "max_attempts: 5, backoff_ms: 1000");
    let job = job(&yaml);
    let cancel = CancellationToken::new();

    let (report, _) = tokio::join!(
        engine.run_with_cancel(&job, seed(json!({})), false, cancel.clone()),
        async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            cancel.cancel();
        }
    );

    let report = report.unwrap();
    assert_eq!(report.status, RunStatus::RolledBack);
    assert_eq!(report.error.unwrap().error, "cancelled");
    assert_eq!(http.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn run_time_limit_aborts_a_slow_run() {
    let http = FakeHttp::with_handler(|_| Ok(response(503, json!({}))));
    let resolver = StaticResolver::new().with("api", http.handle());
    let config = EngineConfig {
        limits: RunLimits {
            max_run_time: Some(Duration::from_secs(5)),
            ..RunLimits::default()
        },
        ..EngineConfig::default()
    };
    let (engine, _) = engine_with(resolver, config);
    let yaml = API_JOB.replace("backoff_ms: 100", "backoff_ms: 10000");

    let report = engine.run(&job(&yaml), seed(json!({})), false).await.unwrap();

    assert_eq!(report.status, RunStatus::RolledBack);
    let error = report.error.unwrap();
    assert_eq!(error.error, "timed_out");
    assert_eq!(error.step_id, "push");
    assert_eq!(http.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn db_retry_rewinds_to_a_fresh_savepoint() {
    let db = FakeDb::new();
    db.fail_next(ConnectorError::new(FailureKind::DbDeadlock, "deadlock detected"));
    let resolver = StaticResolver::new().with("db", db.handle());
    let (engine, _) = engine(resolver);
    let yaml = r#"
id: deadlocked
connections:
  db: { type: postgres, config: { host: localhost } }
steps:
  - id: save
    type: db.upsert
    connection: db
    table: items
    key: [sku]
    mapping: { sku: A1, qty: 1 }
    retry: { max_attempts: 3, backoff_ms: 10 }
"#;

    let report = engine.run(&job(yaml), seed(json!({})), false).await.unwrap();

    assert_eq!(report.status, RunStatus::Committed);
    assert_eq!(report.step("save").unwrap().attempts, 2);
    assert_eq!(
        db.calls(),
        vec![
            "begin",
            "savepoint portl_sp_1",
            "execute upsert",
            "rollback_to portl_sp_1",
            "savepoint portl_sp_2",
            "execute upsert",
            "release portl_sp_2",
            "commit",
        ]
    );
    assert_eq!(db.committed().len(), 1);
}
