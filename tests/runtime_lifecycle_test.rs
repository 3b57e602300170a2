//! Tests for runtime construction, configuration loading, and shutdown

use realtime_resilience::config::CONFIG_ENV_VAR;
use realtime_resilience::rate_limit::POLLING;
use realtime_resilience::{
    Clock, ErrorContext, ErrorKind, MockClock, RateLimitStrategy, RecoverySignal,
    ResilienceConfig, ResilienceError, ResilienceRuntime,
};
use std::time::Duration;
mod common;
use common::mock_support::{ScriptedOperation, fast_runtime, wait_for_active};

static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

const CONFIG_JSON: &str = r#"{
    "recovery": { "max_concurrent_recoveries": 3, "global_timeout_ms": 60000 },
    "handler": { "max_log_entries": 5 },
    "retry_policies": {
        "fetch": { "max_retries": 1, "base_delay_ms": 1, "max_delay_ms": 1, "backoff_multiplier": 1.0 }
    },
    "rate_limits": {
        "search": { "max_requests": 2, "window_ms": 1000, "strategy": "sliding_window" }
    }
}"#;

#[tokio::test]
async fn test_builder_from_json() {
    let runtime = ResilienceRuntime::builder()
        .config_from_str(CONFIG_JSON)
        .unwrap()
        .clock(MockClock::fixed())
        .without_cleanup_task()
        .build()
        .unwrap();

    assert_eq!(runtime.recovery().config().max_concurrent_recoveries, 3);
    assert_eq!(runtime.handler().config().max_log_entries, 5);
    assert_eq!(runtime.recovery().retry_policy(ErrorKind::Fetch).max_retries, 1);
    assert_eq!(
        runtime.rate_limiter().rate_limit("search").unwrap().strategy,
        RateLimitStrategy::SlidingWindow
    );
    assert_eq!(runtime.config().rate_limits.len(), 1);

    let op = ScriptedOperation::failing();
    let outcome = runtime.handle("fetch failed", None, Some(&op), None).await;
    assert!(!outcome.success);
    assert_eq!(op.calls(), 1);
}

#[test]
fn test_invalid_json_is_config_error() {
    let err = ResilienceRuntime::builder()
        .config_from_str("{ not json")
        .err()
        .unwrap();
    assert!(matches!(err, ResilienceError::Config(_)));
    assert!(err.to_string().contains("Invalid resilience config JSON"));
}

#[tokio::test]
async fn test_config_from_env() {
    let _lock = ENV_LOCK.lock().await;
    let path = std::env::temp_dir().join(format!(
        "realtime-resilience-lifecycle-{}.json",
        std::process::id()
    ));
    std::fs::write(&path, CONFIG_JSON).unwrap();
    unsafe { std::env::set_var(CONFIG_ENV_VAR, &path) };

    let runtime = ResilienceRuntime::builder()
        .config_from_env()
        .unwrap()
        .without_cleanup_task()
        .build();

    unsafe { std::env::remove_var(CONFIG_ENV_VAR) };
    let _ = std::fs::remove_file(&path);

    let runtime = runtime.unwrap();
    assert_eq!(runtime.recovery().config().max_concurrent_recoveries, 3);
}

#[tokio::test]
async fn test_config_from_env_missing_file() {
    let _lock = ENV_LOCK.lock().await;
    unsafe { std::env::set_var(CONFIG_ENV_VAR, "/no/such/resilience.json") };

    let result = ResilienceRuntime::builder().config_from_env();

    unsafe { std::env::remove_var(CONFIG_ENV_VAR) };
    assert!(matches!(result, Err(ResilienceError::Config(_))));
}

#[test]
fn test_config_round_trips_through_json() {
    let config = ResilienceConfig::from_json_str(CONFIG_JSON).unwrap();
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(ResilienceConfig::from_json_str(&json).unwrap(), config);
}

#[tokio::test]
async fn test_runtime_clock_stamps_errors() {
    let clock = MockClock::fixed();
    let runtime = fast_runtime(&clock);
    clock.advance(Duration::from_secs(90));

    let error = runtime.classify("fetch failed", Some(ErrorContext::operation("fetch")));

    assert_eq!(error.timestamp(), clock.now());
    assert_eq!(runtime.clock().now(), clock.now());
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_recovery() {
    let clock = MockClock::fixed();
    let runtime = fast_runtime(&clock);

    let in_flight = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let op = ScriptedOperation::succeeding().with_delay(10_000);
            runtime
                .handle(
                    "fetch failed",
                    Some(ErrorContext::operation("fetch").with_channel("live")),
                    Some(&op),
                    None,
                )
                .await
        })
    };
    wait_for_active(runtime.recovery(), 1).await;

    runtime.shutdown();

    let outcome = tokio::time::timeout(Duration::from_secs(2), in_flight)
        .await
        .expect("shutdown should abort the recovery")
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.signal, Some(RecoverySignal::Cancelled));
    assert!(runtime.recovery().is_shutdown());
    assert!(runtime.recovery().active_recoveries().is_empty());

    // Later recoveries are cancelled before running anything.
    let op = ScriptedOperation::succeeding();
    let late = runtime
        .recovery()
        .recover(
            &runtime.classify("fetch failed", None),
            Some(&op),
            None,
        )
        .await;
    assert_eq!(late.signal, Some(RecoverySignal::Cancelled));
    assert_eq!(op.calls(), 0);
}

#[tokio::test]
async fn test_shutdown_clears_state() {
    let clock = MockClock::fixed();
    let runtime = fast_runtime(&clock);
    runtime.handler().add_error_listener(|_: &realtime_resilience::ClassifiedError| {});
    runtime.record_request(POLLING, Some("board"));
    runtime.handle("invalid input", None, None, None).await;

    runtime.shutdown();

    assert_eq!(runtime.rate_limiter().tracked_keys(), 0);
    assert!(runtime.handler().error_log().is_empty());
    assert_eq!(runtime.handler().metrics().total_errors, 0);
    // Configs survive; only state is dropped.
    assert!(runtime.rate_limiter().rate_limit(POLLING).is_some());
}

#[tokio::test]
async fn test_cleanup_task_drops_idle_state() {
    let clock = MockClock::fixed();
    let runtime = ResilienceRuntime::builder()
        .clock(clock.clone())
        .cleanup_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    runtime.record_request(POLLING, Some("board"));
    assert_eq!(runtime.rate_limiter().tracked_keys(), 1);

    clock.advance(Duration::from_secs(25 * 60 * 60));
    let mut cleaned = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if runtime.rate_limiter().tracked_keys() == 0 {
            cleaned = true;
            break;
        }
    }
    assert!(cleaned, "cleanup task should drop idle state");
    runtime.shutdown();
}

#[tokio::test]
async fn test_check_rate_limit_through_runtime() {
    let clock = MockClock::fixed();
    let runtime = fast_runtime(&clock);

    for _ in 0..60 {
        assert!(runtime.check_rate_limit(POLLING, None).allowed);
        runtime.record_request(POLLING, None);
    }
    let denied = runtime.check_rate_limit(POLLING, None);
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(Duration::from_secs(60)));

    // Errors never block window strategies.
    runtime.record_error(POLLING, None);
    clock.advance(Duration::from_secs(60));
    assert!(runtime.check_rate_limit(POLLING, None).allowed);
}

#[tokio::test]
async fn test_zero_cleanup_interval_is_rejected() {
    let err = ResilienceRuntime::builder()
        .clock(MockClock::fixed())
        .cleanup_interval(Duration::ZERO)
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ResilienceError::Config(_)));
    assert!(err.to_string().contains("cleanup_interval"));

    // Driving the limiter's task directly clamps instead of panicking.
    let runtime = fast_runtime(&MockClock::fixed());
    runtime.rate_limiter().start_cleanup_task(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(20)).await;
    runtime.record_request(POLLING, Some("board"));
    assert_eq!(runtime.rate_limiter().tracked_keys(), 1);
    runtime.shutdown();
}
